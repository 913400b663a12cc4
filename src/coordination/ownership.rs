//! Which lease token the current execution context believes it holds.
//!
//! Tokens are remembered per tokio task (or per OS thread when called outside
//! a runtime).  Nothing here talks to the store; the registry only records
//! what this process acquired so that extension and release can prove
//! ownership later.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::OwnershipMode;

/// Identity of the task or thread issuing a lock call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl ContextId {
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(std::thread::current().id()),
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(id) => write!(f, "task-{id}"),
            Self::Thread(id) => {
                // ThreadId only exposes Debug ("ThreadId(7)").
                let raw = format!("{id:?}");
                let n = raw.trim_start_matches("ThreadId(").trim_end_matches(')');
                write!(f, "thread-{n}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Slot {
    context: ContextId,
    /// `None` in single-slot mode, where every key shares one slot.
    storage_key: Option<String>,
}

/// A remembered token and the storage key it was minted for.
#[derive(Debug, Clone)]
struct Held {
    storage_key: String,
    token: String,
}

#[derive(Debug)]
pub struct OwnershipRegistry {
    mode: OwnershipMode,
    tokens: Mutex<HashMap<Slot, Held>>,
}

impl OwnershipRegistry {
    pub fn new(mode: OwnershipMode) -> Self {
        Self {
            mode,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> OwnershipMode {
        self.mode
    }

    /// Record `token` as held by `context`, replacing whatever the slot held.
    pub fn remember(&self, context: ContextId, storage_key: &str, token: &str) {
        let slot = self.slot(context, storage_key);
        self.tokens().insert(
            slot,
            Held {
                storage_key: storage_key.to_string(),
                token: token.to_string(),
            },
        );
    }

    pub fn recall(&self, context: ContextId, storage_key: &str) -> Option<String> {
        let slot = self.slot(context, storage_key);
        self.tokens().get(&slot).map(|held| held.token.clone())
    }

    pub fn forget(&self, context: ContextId, storage_key: &str) {
        let slot = self.slot(context, storage_key);
        self.tokens().remove(&slot);
    }

    /// Clear the slot only if it still holds `token` minted for
    /// `storage_key`.  Returns `true` if it did.
    ///
    /// In single-slot mode the slot may hold the token of another key, which
    /// is left alone.
    pub fn forget_if(&self, context: ContextId, storage_key: &str, token: &str) -> bool {
        let slot = self.slot(context, storage_key);
        let mut tokens = self.tokens();
        let matches = tokens
            .get(&slot)
            .is_some_and(|held| held.token == token && held.storage_key == storage_key);
        if matches {
            tokens.remove(&slot);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, context: ContextId, storage_key: &str) -> Slot {
        let storage_key = match self.mode {
            OwnershipMode::SingleSlot => None,
            OwnershipMode::PerKey => Some(storage_key.to_string()),
        };
        Slot {
            context,
            storage_key,
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<Slot, Held>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A token recorded before an acquisition attempt.
///
/// Unless [`PendingClaim::commit`] is called, dropping the claim removes the
/// token again.  That covers a failed attempt as well as an acquire future
/// that is dropped mid-spin.
pub(crate) struct PendingClaim<'a> {
    registry: &'a OwnershipRegistry,
    context: ContextId,
    storage_key: String,
    token: String,
    armed: bool,
}

impl<'a> PendingClaim<'a> {
    pub(crate) fn record(
        registry: &'a OwnershipRegistry,
        context: ContextId,
        storage_key: &str,
        token: &str,
    ) -> Self {
        registry.remember(context, storage_key, token);
        Self {
            registry,
            context,
            storage_key: storage_key.to_string(),
            token: token.to_string(),
            armed: true,
        }
    }

    pub(crate) fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry
                .forget_if(self.context, &self.storage_key, &self.token);
        }
    }
}
