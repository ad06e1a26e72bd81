//! Conversation-id bookkeeping.
//!
//! Dify assigns a `conversation_id` on the first turn of a conversation and
//! expects it back on every following turn. Callers only hand us the full
//! turn list, so the id has to be remembered here: per caller handle in a
//! shared [`ConversationStore`], and per model instance in a
//! [`SessionManager`] cell for calls that carry no handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SESSION_MAX_ENTRIES: usize = 10_000;

/// Handle → remote conversation id. Last write wins per handle.
pub trait ConversationStore: Send + Sync {
    fn get(&self, handle: &str) -> Option<String>;
    fn set(&self, handle: &str, conversation_id: &str);
    fn remove(&self, handle: &str) -> Option<String>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type ConversationStoreRef = Arc<dyn ConversationStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    /// Idle time after which an entry is forgotten. `None` keeps entries forever.
    pub ttl: Option<Duration>,
    /// Upper bound on tracked handles. `None` is unbounded.
    pub max_entries: Option<usize>,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            ttl: Some(DEFAULT_SESSION_TTL),
            max_entries: Some(DEFAULT_SESSION_MAX_ENTRIES),
        }
    }
}

#[derive(Debug, Clone)]
struct StoreEntry {
    conversation_id: String,
    touched_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    policy: StorePolicy,
    entries: Mutex<HashMap<String, StoreEntry>>,
}

impl InMemoryConversationStore {
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    fn is_expired(&self, entry: &StoreEntry, now: Instant) -> bool {
        self.policy
            .ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.touched_at) > ttl)
    }

    fn prune(&self, entries: &mut HashMap<String, StoreEntry>, now: Instant) {
        if self.policy.ttl.is_some() {
            let before = entries.len();
            entries.retain(|_, entry| !self.is_expired(entry, now));
            let expired = before - entries.len();
            if expired > 0 {
                debug!(expired, "dropped idle conversation handles");
            }
        }

        let Some(max_entries) = self.policy.max_entries else {
            return;
        };
        while entries.len() > max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched_at)
                .map(|(handle, _)| handle.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            debug!(handle = %oldest, "evicted least recently used conversation handle");
        }
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn get(&self, handle: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .expect("conversation store lock poisoned");
        let expired = entries
            .get(handle)
            .is_some_and(|entry| self.is_expired(entry, now));
        if expired {
            entries.remove(handle);
            return None;
        }
        let entry = entries.get_mut(handle)?;
        entry.touched_at = now;
        Some(entry.conversation_id.clone())
    }

    fn set(&self, handle: &str, conversation_id: &str) {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .expect("conversation store lock poisoned");
        entries.insert(
            handle.to_string(),
            StoreEntry {
                conversation_id: conversation_id.to_string(),
                touched_at: now,
            },
        );
        self.prune(&mut entries, now);
    }

    fn remove(&self, handle: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("conversation store lock poisoned")
            .remove(handle)
            .map(|entry| entry.conversation_id)
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("conversation store lock poisoned")
            .len()
    }
}

/// The model instance's "current conversation" cell.
#[derive(Debug, Default)]
pub struct SessionManager {
    conversation_id: Mutex<Option<String>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id
            .lock()
            .expect("session manager lock poisoned")
            .clone()
    }

    pub fn set_conversation_id(&self, conversation_id: Option<String>) {
        *self
            .conversation_id
            .lock()
            .expect("session manager lock poisoned") = conversation_id;
    }

    pub fn reset_conversation(&self) {
        self.set_conversation_id(None);
    }
}

/// Session view of one call: the shared store, the instance cell, and the
/// caller's handle if any.
#[derive(Clone)]
pub struct ConversationScope {
    store: ConversationStoreRef,
    session: Arc<SessionManager>,
    handle: Option<String>,
}

impl ConversationScope {
    pub fn new(
        store: ConversationStoreRef,
        session: Arc<SessionManager>,
        handle: Option<String>,
    ) -> Self {
        Self {
            store,
            session,
            handle,
        }
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    /// Last known id for this call: handle-keyed when a handle is present,
    /// the instance cell otherwise.
    pub fn lookup(&self) -> Option<String> {
        match self.handle.as_deref() {
            Some(handle) => self.store.get(handle),
            None => self.session.conversation_id(),
        }
    }

    /// Records an id observed from the remote.
    pub fn observe(&self, conversation_id: &str) {
        if self.session.conversation_id().as_deref() != Some(conversation_id) {
            self.session
                .set_conversation_id(Some(conversation_id.to_string()));
        }

        let Some(handle) = self.handle.as_deref() else {
            return;
        };
        let previous = self.store.get(handle);
        if previous.as_deref() != Some(conversation_id) {
            self.store.set(handle, conversation_id);
            info!(
                handle,
                conversation_id,
                previous = previous.as_deref().unwrap_or("-"),
                "updated conversation id for chat handle"
            );
        }
    }
}
