//! Listener bookkeeping shared by transport implementations.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by a listener registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

impl ListenerToken {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> ListenerToken {
    ListenerToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
}

/// An ordered list of listeners.
pub struct ListenerList<L> {
    entries: RwLock<Vec<(ListenerToken, L)>>,
}

impl<L: Clone> ListenerList<L> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: L) -> ListenerToken {
        let token = next_token();
        self.entries.write().push((token, listener));
        token
    }

    /// Returns `true` if the token was registered.
    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    /// Copy of the current listeners, so they can run without the lock held.
    #[must_use]
    pub fn snapshot(&self) -> Vec<L> {
        self.entries.read().iter().map(|(_, l)| l.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<L: Clone> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Listeners grouped by event name.
pub struct ListenerTable<L> {
    entries: RwLock<HashMap<String, Vec<(ListenerToken, L)>>>,
}

impl<L: Clone> ListenerTable<L> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, name: &str, listener: L) -> ListenerToken {
        let token = next_token();
        self.entries
            .write()
            .entry(name.to_string())
            .or_default()
            .push((token, listener));
        token
    }

    /// Returns `true` if the token was registered under any name.
    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut entries = self.entries.write();
        let mut removed = false;
        entries.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(t, _)| *t != token);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Listeners registered for `name`, cloned out of the lock.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Vec<L> {
        self.entries
            .read()
            .get(name)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of listeners registered for `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.entries.read().get(name).map_or(0, Vec::len)
    }
}

impl<L: Clone> Default for ListenerTable<L> {
    fn default() -> Self {
        Self::new()
    }
}
