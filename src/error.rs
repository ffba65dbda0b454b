//! Cycle-level error taxonomy.

use thiserror::Error;

use crate::drive::{AuthError, StoreError};
use crate::model::SyncStep;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local credential material is missing or malformed. Operator action needed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The refresh token is no longer accepted. Re-run the consent flow.
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("malformed source: {0}")]
    MalformedSource(String),
    /// Store call still failing after the retry budget was spent.
    #[error("remote store unavailable: {0}")]
    RemoteStoreTransient(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Auth(AuthError::Configuration(msg)) => SyncError::Configuration(msg),
            StoreError::Auth(AuthError::Authentication(msg)) => SyncError::Authentication(msg),
            StoreError::Auth(AuthError::Transient(msg)) => SyncError::RemoteStoreTransient(msg),
            err @ StoreError::Transient { .. } => SyncError::RemoteStoreTransient(err.to_string()),
            other => SyncError::Store(other),
        }
    }
}

impl SyncError {
    /// Short machine-readable kind, used in status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::Authentication(_) => "authentication",
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::MalformedSource(_) => "malformed_source",
            SyncError::RemoteStoreTransient(_) => "remote_store_transient",
            SyncError::Store(_) => "remote_store",
        }
    }
}

/// A cycle aborted at `step`.
#[derive(Debug, Error)]
#[error("sync failed during {step}: {error}")]
pub struct StepFailure {
    pub step: SyncStep,
    #[source]
    pub error: SyncError,
}

impl StepFailure {
    pub fn new(step: SyncStep, error: impl Into<SyncError>) -> Self {
        Self {
            step,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let e: SyncError = StoreError::Auth(AuthError::Configuration("no client_id".into())).into();
        assert!(matches!(e, SyncError::Configuration(_)));

        let e: SyncError = StoreError::Auth(AuthError::Authentication("revoked".into())).into();
        assert!(matches!(e, SyncError::Authentication(_)));

        let e: SyncError = StoreError::Transient {
            op: "copy_file",
            message: "503".into(),
        }
        .into();
        assert_eq!(e.kind(), "remote_store_transient");

        let e: SyncError = StoreError::NotFound("x".into()).into();
        assert!(matches!(e, SyncError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn step_failure_display_names_step() {
        let f = StepFailure::new(SyncStep::Fetch, SyncError::SourceUnavailable("timeout".into()));
        assert_eq!(f.to_string(), "sync failed during fetch: source unavailable: timeout");
    }
}
