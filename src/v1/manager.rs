use thiserror::Error;

use super::{confirm::ConfirmationStrategy, couchbase::ReconcileContext};

/// How a kind applies a changed desired state to an existing remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Re-submit the full desired attribute set in place.
    Upsert,
    /// The definition cannot be altered in place: drop the object and create it again.
    DropAndRecreate,
}

/// Per-kind primitives the reconciler composes into create/read/update/delete.
///
/// Implementations issue exactly one remote call per method and never wait or retry;
/// the confirmation phase belongs to the reconciler.
pub trait ResourceManager<Input, Output>: Send + Sync {
    fn kind(&self) -> &'static str;
    fn identity(&self, desired: &Input) -> String;
    fn validate(&self, _desired: &Input) -> Result<(), ManagerError> {
        Ok(())
    }
    fn lookup(&self, ctx: &ReconcileContext, identity: &str)
        -> Result<Option<Output>, ManagerError>;
    fn submit_create(&self, ctx: &ReconcileContext, desired: &Input) -> Result<(), ManagerError>;
    fn submit_update(&self, ctx: &ReconcileContext, desired: &Input) -> Result<(), ManagerError> {
        self.submit_create(ctx, desired)
    }
    fn remove(&self, ctx: &ReconcileContext, identity: &str) -> Result<(), ManagerError>;
    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::Upsert
    }
    fn confirmation<'c>(&self, ctx: &'c ReconcileContext) -> &'c ConfirmationStrategy;
    /// Whether a looked-up object counts as visible for the confirmation phase.
    fn is_visible(&self, _observed: &Output) -> bool {
        true
    }
    fn has_drifted(&self, desired: &Input, observed: &Output) -> bool;
}

#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("{0} was not visible before the confirmation budget ran out")]
    PropagationTimeout(String),
    #[error("Update left {identity} absent: {source}")]
    PartialUpdate {
        identity: String,
        source: Box<ManagerError>,
    },
    #[error("DeleteFail: {0}")]
    DeleteFail(String),
    #[error("CreateFail: {0}")]
    CreateFail(String),
    #[error("UpdateFail: {0}")]
    UpdateFail(String),
    #[error("LookupFail: {0}")]
    LookupFail(String),
}

impl ManagerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManagerError::NotFound(_))
    }
}
