//! Error kinds for the entity runtime.

use thiserror::Error;

/// Errors raised by the [`crate::rich`] serde layer.
#[derive(Debug, Error)]
pub enum RichError {
    #[error("failed to encode value: {0}")]
    Encode(#[source] anyhow::Error),
    #[error("failed to decode value: {0}")]
    Decode(#[source] anyhow::Error),
    #[error("value shape did not match the expected type")]
    ShapeMismatch,
}

/// Errors raised while diffing or applying a [`crate::patch::Patch`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    #[error("patch path does not exist in the target value")]
    PathNotFound,
    #[error("patch op expected an object or array at the given path")]
    NotAContainer,
}

/// Mismatch between a persisted snapshot/event's `entityDefName` and the
/// definition's own name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("persisted entity def name '{found}' does not match definition '{expected}'")]
pub struct DefinitionMismatchError {
    pub expected: String,
    pub found: String,
}

/// The store returned non-contiguous event versions during hydration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected next event version {expected}, found {found}")]
pub struct OutOfOrderEventsError {
    pub expected: u64,
    pub found: u64,
}

/// Hydration (load + apply snapshot/events) failed.
#[derive(Debug, Error)]
pub enum HydrationError {
    #[error(transparent)]
    DefinitionMismatch(#[from] DefinitionMismatchError),
    #[error(transparent)]
    OutOfOrderEvents(#[from] OutOfOrderEventsError),
    #[error(transparent)]
    Rich(#[from] RichError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("store error during hydration: {0}")]
    Store(#[source] anyhow::Error),
}

/// The optimistic version check at commit time failed, or the store
/// otherwise rejected the write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("commit rejected: expected version {expected}, store is at {actual}")]
pub struct ConflictError {
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("store error during commit: {0}")]
    Store(#[source] anyhow::Error),
    #[error(transparent)]
    Rich(#[from] RichError),
}

/// An interaction was attempted against an entity that is `failed` or
/// `stopped`.
#[derive(Debug, Error, Clone)]
#[error("entity '{id}' is {status} and rejects further interactions")]
pub struct StoppedEntityError {
    pub id: String,
    pub status: &'static str,
}

/// An interaction was attempted after `Manager::stop` completed.
#[derive(Debug, Error, Clone, Copy, Default)]
#[error("manager has been shut down")]
pub struct ManagerShutdownError;

/// The supervisor chose to reset the entity in response to a handler
/// error; wraps the original cause.
#[derive(Debug, Error)]
#[error("entity was reset by its supervisor: {source}")]
pub struct ResetError {
    #[source]
    pub source: anyhow::Error,
}

/// Top-level error returned by [`crate::manager::EntityRef`] operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Hydration(#[from] HydrationError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Stopped(#[from] StoppedEntityError),
    #[error(transparent)]
    ManagerShutdown(#[from] ManagerShutdownError),
    #[error(transparent)]
    Reset(#[from] ResetError),
    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),
    #[error("handler '{0}' is not a command")]
    NotACommand(String),
    #[error("handler '{0}' is not a query")]
    NotAQuery(String),
    #[error("handler '{0}' is not a stream")]
    NotAStream(String),
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),
    #[error(transparent)]
    Rich(#[from] RichError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("this operation requires a store")]
    NoStore,
}
