use crate::store::StoreError;

/// Revocation errors surfaced to callers.
///
/// Only the write path (revoking) ever returns these; check-path failures
/// are resolved locally by the configured failure policy, and event-publish
/// failures are logged rather than surfaced.
#[derive(thiserror::Error, Debug)]
pub enum RevocationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Revocation store operation timed out")]
    StoreTimeout,
}
