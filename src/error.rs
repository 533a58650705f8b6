//! Error taxonomy shared by the store, the watch layer, and the Mounter.

use thiserror::Error;

use crate::model::ModelRef;

/// Errors a [`StoreClient`](crate::store::StoreClient) implementation reports back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model {0} not found")]
    NotFound(ModelRef),

    #[error("resource version conflict patching {0}")]
    Conflict(ModelRef),

    #[error("transient store error for {0}")]
    Transient(ModelRef, #[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn model(&self) -> &ModelRef {
        match self {
            StoreError::NotFound(m) | StoreError::Conflict(m) | StoreError::Transient(m, _) => m,
        }
    }
}

/// Errors the Mounter surfaces while reconciling one parent.
#[derive(Debug, Error)]
pub enum MounterError {
    #[error("malformed mount entry for {gvr}/{nsn}: {reason}")]
    MalformedMount { gvr: String, nsn: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Opaque error type returned by a user-supplied reconcile or delete handler.
///
/// The Mounter never observes this type; it is surfaced by the
/// [`Reconciler`](crate::reconciler::Reconciler) to its caller as a retryable
/// condition.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors parsing the driver process's environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
}
