use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use tracing::warn;

/// Callback family a redelivery key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Message,
    Call,
}

impl CallbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Call => "call",
        }
    }
}

type Key = (CallbackKind, String, String);

/// Keys allocated up front; larger guards grow on demand.
const INITIAL_SLOTS: usize = 1024;

/// Remembers the most recent `(sid, status)` pairs so provider redeliveries are
/// acknowledged without being counted twice. The oldest key is evicted first.
#[derive(Clone)]
pub struct RedeliveryGuard {
    inner: Arc<Mutex<Seen>>,
}

struct Seen {
    capacity: usize,
    order: VecDeque<Key>,
    keys: HashSet<Key>,
}

impl RedeliveryGuard {
    /// Returns `None` for a zero capacity, which disables suppression.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let initial = capacity.min(INITIAL_SLOTS);
        Some(Self {
            inner: Arc::new(Mutex::new(Seen {
                capacity,
                order: VecDeque::with_capacity(initial),
                keys: HashSet::with_capacity(initial),
            })),
        })
    }

    /// Records the key and reports whether it was new.
    ///
    /// Callbacks without a SID cannot be told apart and are always treated as new.
    pub fn first_delivery(&self, kind: CallbackKind, sid: &str, status: &str) -> bool {
        if sid.is_empty() {
            return true;
        }
        let key = (kind, sid.to_string(), status.to_string());
        let mut seen = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(stage = "webhook", "redelivery guard lock poisoned, recovering");
                poisoned.into_inner()
            }
        };

        if seen.keys.contains(&key) {
            return false;
        }
        if seen.order.len() == seen.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.keys.remove(&oldest);
            }
        }
        seen.keys.insert(key.clone());
        seen.order.push_back(key);
        true
    }
}
