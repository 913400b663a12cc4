use std::time::Duration;

/// Failures surfaced by [`crate::GlobalLock`].
///
/// The compatibility calls (`lock`, `unlock`, ...) only return
/// [`LockError::InvalidKey`], or [`LockError::TimedOut`] when a wait timeout
/// is configured.  Store failures are logged and folded into a negative
/// result there.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("'key' must not be empty")]
    InvalidKey,

    /// The store could not be reached or rejected the command.
    #[error("lock store unavailable")]
    Store(#[source] anyhow::Error),

    #[error("gave up waiting for lock {key} after {waited:?}")]
    TimedOut { key: String, waited: Duration },
}

impl LockError {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
