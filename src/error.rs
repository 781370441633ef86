//! Error types for the engine and its collaborators
//!
//! Failures are always scoped to a single operation; nothing here is fatal
//! to the process.

use crate::db::DbError;

/// Errors from a persistence gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The store could not be reached
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    /// A referenced conversation or node does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Local SQLite storage failed
    #[error("storage error: {0}")]
    Storage(#[source] DbError),
}

impl From<DbError> for GatewayError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => GatewayError::NotFound(what),
            DbError::Connection(msg) => GatewayError::Unavailable(msg),
            other => GatewayError::Storage(other),
        }
    }
}

/// Errors from the completion or summarization service
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    /// The service could not be reached
    #[error("completion service unavailable: {0}")]
    Unavailable(String),

    /// The service refused the request
    #[error("completion rejected: {0}")]
    Rejected(String),
}

/// Why a send did not complete
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Neither text nor attachments were given
    #[error("nothing to send")]
    EmptyPrompt,

    /// Another main-path send is still outstanding
    #[error("a response is already being generated")]
    Busy,

    /// The target node is already streaming a response
    #[error("node {0} is already generating")]
    NodeBusy(String),

    /// The target or branch origin is not in the tree
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The completion service failed; local state was rolled back
    #[error("generation failed: {0}")]
    Generation(String),

    /// The response was generated but could not be saved
    #[error("could not save response: {0}")]
    Persistence(#[source] GatewayError),
}

impl SendError {
    /// Whether the user already saw a model response for this send
    #[inline]
    #[must_use]
    pub fn response_was_shown(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl From<CompletionError> for SendError {
    fn from(e: CompletionError) -> Self {
        SendError::Generation(e.to_string())
    }
}

/// Errors from engine operations other than sending
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
