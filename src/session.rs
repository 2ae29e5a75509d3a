//! Sessions: one managed endpoint per connection
//!
//! A `Session` owns a [`Codec`] and adds lifecycle state on top of it:
//!
//! - **Open → Closed**, exactly once, guarded by a compare-and-swap
//! - **Synchronous send** (queue capacity 0): the caller writes through the
//!   codec under an exclusive send lock
//! - **Asynchronous send** (capacity > 0): messages go into a bounded queue
//!   drained by one background task; a full queue closes the session
//!   instead of blocking the producer. After close the drain task keeps
//!   writing what it accepted, for at most [`CLOSE_LINGER`], and then closes
//!   the codec
//! - **Close callbacks**: run once, in registration order, on a background
//!   task spawned by the winning `close()` call. They may still be running
//!   when `close()` returns.
//!
//! Any send or receive error closes the session. A closed session is done for
//! good; reconnecting means building a new one.
//!
//! Sessions with an asynchronous queue spawn their drain task at
//! construction, and every `close()` spawns the callback task, so both must
//! happen inside a tokio runtime.

use crate::codec::Codec;
use crate::error::{NetError, Result};
use crate::manager::ManagerShared;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// How long a closed queued session keeps writing already accepted messages
/// before its codec is closed regardless
pub const CLOSE_LINGER: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

/// Shared source of session ids.
///
/// Clones share one counter. Independent contexts may hand out the same ids,
/// which is fine as long as their sessions never meet in one manager.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    last_id: Arc<AtomicU64>,
}

impl EngineContext {
    /// Create a context whose first session id is 1
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ---------------------------------------------------------------------------
// Close callbacks
// ---------------------------------------------------------------------------

/// Identity of a close-callback owner, e.g. one [`SessionGroup`](crate::SessionGroup)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a process-unique owner id
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of one registered close callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    pub owner: OwnerId,
    pub key: u64,
}

type CloseAction = Box<dyn FnOnce() + Send + 'static>;

struct CloseCallback {
    key: CallbackKey,
    action: CloseAction,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve once the watched flag is `true` or its sender is gone
pub(crate) async fn wait_true(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A codec bound to lifecycle and concurrency state
pub struct Session<C: Codec> {
    id: u64,
    codec: Arc<C>,

    /// Asynchronous queue sender. The lock doubles as the send lock: shared
    /// for queued sends, exclusive for synchronous sends and for closing.
    outbound: RwLock<Option<mpsc::Sender<C::Message>>>,
    queued: bool,
    drain: StdMutex<Option<JoinHandle<()>>>,
    recv_lock: Mutex<()>,

    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    callbacks: StdMutex<Option<Vec<CloseCallback>>>,
    manager: OnceLock<Weak<ManagerShared<C>>>,

    state: StdMutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl<C: Codec> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("queued", &self.queued)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<C: Codec> Session<C> {
    /// Create a standalone session.
    ///
    /// With `send_queue_capacity > 0`, `send` enqueues and a background task
    /// writes; otherwise `send` writes directly.
    pub fn new(ctx: &EngineContext, codec: C, send_queue_capacity: usize) -> Arc<Self> {
        let id = ctx.next_session_id();
        let codec = Arc::new(codec);
        let (close_signal, close_rx) = watch::channel(false);

        Arc::new_cyclic(|session| {
            let (sender, drain) = if send_queue_capacity > 0 {
                let (tx, rx) = mpsc::channel(send_queue_capacity);
                let drain = tokio::spawn(send_loop(
                    id,
                    Arc::clone(&codec),
                    session.clone(),
                    rx,
                    close_rx,
                ));
                (Some(tx), Some(drain))
            } else {
                (None, None)
            };

            Self {
                id,
                codec,
                queued: sender.is_some(),
                outbound: RwLock::new(sender),
                drain: StdMutex::new(drain),
                recv_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                close_signal,
                callbacks: StdMutex::new(Some(Vec::new())),
                manager: OnceLock::new(),
                state: StdMutex::new(None),
            }
        })
    }

    /// Session id, unique within its [`EngineContext`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The codec this session writes and reads through
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// True if sends go through the asynchronous queue
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        let mut rx = self.close_signal.subscribe();
        wait_true(&mut rx).await;
    }

    pub(crate) fn attach_manager(&self, manager: Weak<ManagerShared<C>>) {
        let _ = self.manager.set(manager);
    }

    /// Send one message.
    ///
    /// Queued sessions return as soon as the message is enqueued; a full
    /// queue closes the session and returns [`NetError::Blocked`].
    /// Synchronous sessions return the codec's result. Any codec error closes
    /// the session.
    pub async fn send(&self, msg: C::Message) -> Result<()> {
        if !self.queued {
            return self.send_now(msg).await;
        }

        let outcome = {
            let outbound = self.outbound.read().await;
            if self.is_closed() {
                return Err(NetError::Closed);
            }
            match outbound.as_ref() {
                Some(tx) => tx.try_send(msg),
                None => return Err(NetError::Closed),
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = self.id, "Send queue full, closing session");
                let _ = self.close().await;
                Err(NetError::Blocked)
            }
            Err(TrySendError::Closed(_)) => Err(NetError::Closed),
        }
    }

    async fn send_now(&self, msg: C::Message) -> Result<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let result = {
            let _send = self.outbound.write().await;
            self.codec.send(msg).await
        };
        if let Err(e) = result {
            tracing::debug!(session_id = self.id, error = %e, "Send failed, closing session");
            let _ = self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Receive the next message. Any error closes the session.
    pub async fn receive(&self) -> Result<C::Message> {
        let result = {
            let _recv = self.recv_lock.lock().await;
            self.codec.receive().await
        };
        if let Err(e) = &result {
            tracing::debug!(session_id = self.id, error = %e, "Receive failed, closing session");
            let _ = self.close().await;
        }
        result
    }

    /// Close the session.
    ///
    /// Only the first call does anything; later calls return
    /// [`NetError::Closed`]. Close callbacks and manager removal run on a
    /// spawned task and may complete after this returns.
    ///
    /// A synchronous session closes its codec here, aborting any in-flight
    /// send or receive, and returns the codec's close result. A queued
    /// session leaves that to its drain task, which first writes the messages
    /// accepted before the close; manager removal waits for it.
    pub async fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NetError::Closed);
        }

        self.close_signal.send_replace(true);

        let drain = if self.queued {
            // Dropping the sender lets the drain task finish the queue
            self.outbound.write().await.take();
            lock(&self.drain).take()
        } else {
            None
        };

        let callbacks = lock(&self.callbacks).take().unwrap_or_default();
        let manager = self.manager.get().cloned();
        let id = self.id;
        tokio::spawn(async move {
            for callback in callbacks {
                let action = callback.action;
                if std::panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
                    tracing::warn!(
                        session_id = id,
                        owner = ?callback.key.owner,
                        key = callback.key.key,
                        "Close callback panicked"
                    );
                }
            }
            if let Some(drain) = drain {
                let _ = drain.await;
            }
            if let Some(manager) = manager.and_then(|m| m.upgrade()) {
                manager.remove_session(id).await;
            }
        });

        tracing::debug!(session_id = id, "Session closed");
        if self.queued {
            Ok(())
        } else {
            self.codec.close().await
        }
    }

    /// Register `action` to run once when the session closes.
    ///
    /// Does nothing if the session is already closed; a registration racing
    /// with `close()` may be dropped.
    pub fn add_close_callback<F>(&self, owner: OwnerId, key: u64, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        if let Some(callbacks) = lock(&self.callbacks).as_mut() {
            callbacks.push(CloseCallback {
                key: CallbackKey { owner, key },
                action: Box::new(action),
            });
        }
    }

    /// Remove the first callback registered under `(owner, key)`
    pub fn remove_close_callback(&self, owner: OwnerId, key: u64) {
        if self.is_closed() {
            return;
        }
        let target = CallbackKey { owner, key };
        if let Some(callbacks) = lock(&self.callbacks).as_mut() {
            if let Some(pos) = callbacks.iter().position(|cb| cb.key == target) {
                callbacks.remove(pos);
            }
        }
    }

    /// Number of callbacks waiting for close
    pub fn close_callback_count(&self) -> usize {
        lock(&self.callbacks).as_ref().map_or(0, Vec::len)
    }

    /// Attach an opaque user value, replacing any previous one
    pub fn set_state<T: Any + Send + Sync>(&self, state: T) {
        *lock(&self.state) = Some(Arc::new(state));
    }

    /// The user value, if one of type `T` is attached
    pub fn state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let state = lock(&self.state).clone()?;
        state.downcast::<T>().ok()
    }
}

/// Drain the asynchronous queue in FIFO order.
///
/// Messages accepted before a close are still written, until the codec fails
/// or [`CLOSE_LINGER`] has passed since the close. Whatever is left goes to
/// [`Codec::clear_send_queue`], then the codec is closed. A codec error closes
/// the session.
async fn send_loop<C: Codec>(
    id: u64,
    codec: Arc<C>,
    session: Weak<Session<C>>,
    mut rx: mpsc::Receiver<C::Message>,
    mut close_rx: watch::Receiver<bool>,
) {
    let linger = async move {
        wait_true(&mut close_rx).await;
        tokio::time::sleep(CLOSE_LINGER).await;
    };
    tokio::pin!(linger);

    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = &mut linger => {
                tracing::debug!(session_id = id, "Close linger expired with messages queued");
                break;
            }
        };
        let Some(msg) = msg else {
            tracing::trace!(session_id = id, "Send queue closed and drained");
            break;
        };

        let result = tokio::select! {
            biased;
            result = codec.send(msg) => result,
            _ = &mut linger => {
                tracing::debug!(session_id = id, "Close linger expired during a write");
                break;
            }
        };
        if let Err(e) = result {
            tracing::debug!(session_id = id, error = %e, "Send loop stopped by codec error");
            if let Some(session) = session.upgrade() {
                let _ = session.close().await;
            }
            break;
        }
    }

    rx.close();
    let mut pending = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        pending.push(msg);
    }
    if !pending.is_empty() {
        tracing::debug!(session_id = id, count = pending.len(), "Discarding unsent messages");
        codec.clear_send_queue(pending);
    }
    if let Err(e) = codec.close().await {
        tracing::debug!(session_id = id, error = %e, "Codec close failed");
    }
}
