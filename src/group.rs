//! Keyed collections of sessions
//!
//! A [`SessionGroup`] tracks sessions under caller-chosen keys ("everyone in
//! room 42"), independently of any [`Manager`](crate::Manager). Each tracked
//! session carries one close callback that drops its entry when the session
//! closes. Evicting an entry only stops tracking it; the session stays open.

use crate::codec::Codec;
use crate::session::{OwnerId, Session};
use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

struct Entry<C: Codec> {
    session: Arc<Session<C>>,
    /// Callback key registered on `session` for this entry
    token: u64,
}

struct GroupInner<K, C: Codec> {
    owner: OwnerId,
    next_token: AtomicU64,
    entries: Mutex<HashMap<K, Entry<C>>>,
    state: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl<K, C: Codec> GroupInner<K, C> {
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<C>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sessions indexed by key, at most one per key.
///
/// Cheap to clone; clones share the same entries.
pub struct SessionGroup<K, C: Codec> {
    inner: Arc<GroupInner<K, C>>,
}

impl<K, C: Codec> Clone for SessionGroup<K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, C> std::fmt::Debug for SessionGroup<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Codec,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGroup")
            .field("owner", &self.inner.owner)
            .field("len", &self.len())
            .finish()
    }
}

impl<K, C> Default for SessionGroup<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Codec,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C> SessionGroup<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Codec,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                owner: OwnerId::new(),
                next_token: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
                state: Mutex::new(None),
            }),
        }
    }

    /// Owner id this group registers its close callbacks under
    pub fn owner(&self) -> OwnerId {
        self.inner.owner
    }

    /// Track `session` under `key`.
    ///
    /// A session already tracked under `key` is evicted first (its callback
    /// is removed; it is not closed). The entry is dropped automatically
    /// when `session` closes.
    pub fn put(&self, key: K, session: Arc<Session<C>>) {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.inner.entries();

        if let Some(old) = entries.remove(&key) {
            old.session.remove_close_callback(self.inner.owner, old.token);
        }

        let weak: Weak<GroupInner<K, C>> = Arc::downgrade(&self.inner);
        let callback_key = key.clone();
        session.add_close_callback(self.inner.owner, token, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut entries = inner.entries();
            // The key may have been taken over by a newer entry meanwhile
            if entries.get(&callback_key).is_some_and(|e| e.token == token) {
                entries.remove(&callback_key);
            }
        });

        entries.insert(key, Entry { session, token });
    }

    /// Stop tracking `key`. Returns the evicted session, which stays open.
    pub fn remove(&self, key: &K) -> Option<Arc<Session<C>>> {
        let entry = self.inner.entries().remove(key)?;
        entry
            .session
            .remove_close_callback(self.inner.owner, entry.token);
        Some(entry.session)
    }

    /// Session tracked under `key`
    pub fn get(&self, key: &K) -> Option<Arc<Session<C>>> {
        self.inner
            .entries()
            .get(key)
            .map(|e| Arc::clone(&e.session))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries().is_empty()
    }

    /// Visit every tracked session while holding the group lock.
    ///
    /// `action` must not call back into this group.
    pub fn fetch<F>(&self, mut action: F)
    where
        F: FnMut(&Arc<Session<C>>),
    {
        for entry in self.inner.entries().values() {
            action(&entry.session);
        }
    }

    /// Evict every entry, then run `action` on each evicted session.
    ///
    /// `action` runs after the group lock is released, so it may close the
    /// session or touch the group.
    pub fn fetch_and_remove<F>(&self, mut action: F)
    where
        F: FnMut(Arc<Session<C>>),
    {
        for session in self.evict_all() {
            action(session);
        }
    }

    /// Evict every entry without touching the sessions themselves
    pub fn close(&self) {
        let evicted = self.evict_all();
        tracing::debug!(owner = ?self.inner.owner, evicted = evicted.len(), "Session group cleared");
    }

    /// Evict every entry and close each evicted session
    pub async fn close_all(&self) {
        let sessions = self.evict_all();
        tracing::debug!(owner = ?self.inner.owner, count = sessions.len(), "Closing session group");
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
    }

    fn evict_all(&self) -> Vec<Arc<Session<C>>> {
        let drained: Vec<Entry<C>> = {
            let mut entries = self.inner.entries();
            entries.drain().map(|(_, e)| e).collect()
        };
        drained
            .into_iter()
            .map(|entry| {
                entry
                    .session
                    .remove_close_callback(self.inner.owner, entry.token);
                entry.session
            })
            .collect()
    }

    /// Attach an opaque user value to the group, replacing any previous one
    pub fn set_state<T: Any + Send + Sync>(&self, state: T) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(state));
    }

    pub fn state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        state.downcast::<T>().ok()
    }
}
