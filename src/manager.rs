//! Sharded session registry with synchronized shutdown
//!
//! Sessions are spread over a fixed number of shards by `id % shards`, each
//! with its own lock, so registration and removal under load do not contend
//! on one global lock. `dispose` marks every shard as disposing, closes the
//! sessions it collected without holding any shard lock and then waits until
//! every registered session has finished its close sequence.

use crate::codec::Codec;
use crate::config::ManagerConfig;
use crate::session::{EngineContext, Session};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OnceCell};

struct Shard<C: Codec> {
    sessions: HashMap<u64, Arc<Session<C>>>,
    /// Set once disposal reaches this shard; no registrations afterwards
    disposing: bool,
}

pub(crate) struct ManagerShared<C: Codec> {
    shards: Vec<Mutex<Shard<C>>>,
    /// Registered sessions whose removal has not completed yet
    pending: AtomicUsize,
    drained: Notify,
    disposed: OnceCell<()>,
}

impl<C: Codec> ManagerShared<C> {
    fn shard(&self, id: u64) -> &Mutex<Shard<C>> {
        &self.shards[(id % self.shards.len() as u64) as usize]
    }

    /// Called from a registered session's close task.
    ///
    /// While the shard is disposing the sweep owns the map, so only the
    /// pending count is released.
    pub(crate) async fn remove_session(&self, id: u64) {
        {
            let mut shard = self.shard(id).lock().await;
            if !shard.disposing {
                shard.sessions.remove(&id);
            }
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Registry of live sessions.
///
/// Cheap to clone; clones share the same shards.
pub struct Manager<C: Codec> {
    ctx: EngineContext,
    shared: Arc<ManagerShared<C>>,
}

impl<C: Codec> Clone for Manager<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Codec> std::fmt::Debug for Manager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("shards", &self.shared.shards.len())
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<C: Codec> Manager<C> {
    /// Create a manager drawing session ids from `ctx`
    pub fn new(ctx: &EngineContext, config: &ManagerConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    sessions: HashMap::new(),
                    disposing: false,
                })
            })
            .collect();
        Self {
            ctx: ctx.clone(),
            shared: Arc::new(ManagerShared {
                shards,
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
                disposed: OnceCell::new(),
            }),
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shared.shards.len()
    }

    /// Shard a session id maps to
    pub fn shard_of(&self, id: u64) -> usize {
        (id % self.shared.shards.len() as u64) as usize
    }

    /// Build a session around `codec` and register it.
    ///
    /// If the target shard is already being disposed the session is closed
    /// immediately and not registered; it is still returned, closed.
    pub async fn new_session(&self, codec: C, send_queue_capacity: usize) -> Arc<Session<C>> {
        let session = Session::new(&self.ctx, codec, send_queue_capacity);
        let id = session.id();

        let registered = {
            let mut shard = self.shared.shard(id).lock().await;
            if shard.disposing {
                false
            } else {
                session.attach_manager(Arc::downgrade(&self.shared));
                shard.sessions.insert(id, Arc::clone(&session));
                self.shared.pending.fetch_add(1, Ordering::AcqRel);
                true
            }
        };

        if !registered {
            tracing::debug!(session_id = id, "Manager disposing, closing new session");
            let _ = session.close().await;
        }
        session
    }

    /// Registered session by id
    pub async fn get(&self, id: u64) -> Option<Arc<Session<C>>> {
        let shard = self.shared.shard(id).lock().await;
        if shard.disposing {
            return None;
        }
        shard.sessions.get(&id).cloned()
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shared.shards {
            let shard = shard.lock().await;
            if !shard.disposing {
                total += shard.sessions.len();
            }
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every session and wait for all of them to finish closing.
    ///
    /// Runs once; concurrent and later calls wait for that run to finish.
    /// When this returns, every close callback of every session ever
    /// registered here has run.
    pub async fn dispose(&self) {
        self.shared
            .disposed
            .get_or_init(|| async {
                tracing::info!(shards = self.shared.shards.len(), "Disposing session manager");
                let mut sessions = Vec::new();
                for shard in &self.shared.shards {
                    let mut shard = shard.lock().await;
                    shard.disposing = true;
                    sessions.extend(shard.sessions.values().cloned());
                }

                // Closing outside the shard locks lets close tasks reach
                // `remove_session` while other sessions are still closing
                let closed = join_all(sessions.iter().map(|session| session.close()))
                    .await
                    .into_iter()
                    .filter(Result::is_ok)
                    .count();

                self.shared.wait_drained().await;

                for shard in &self.shared.shards {
                    shard.lock().await.sessions.clear();
                }
                tracing::info!(closed, "Session manager disposed");
            })
            .await;
    }
}
