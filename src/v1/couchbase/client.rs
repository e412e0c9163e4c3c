use thiserror::Error;

use super::{
    bucket::{BucketInfo, BucketSettings},
    index::{IndexDefinition, IndexInfo},
    user::{UserInfo, UserSettings},
};
use crate::v1::manager::ManagerError;

/// Management operations the reconciler needs from a cluster.
///
/// Every call is blocking and independent; implementations may open a fresh authenticated
/// session per call. Lookups answer `Ok(None)` for objects the cluster does not know, while
/// removals report them as [`ClientError::NotFound`].
pub trait ClusterClient: Send + Sync {
    fn get_bucket(&self, name: &str) -> Result<Option<BucketInfo>, ClientError>;
    fn insert_bucket(&self, settings: &BucketSettings) -> Result<(), ClientError>;
    fn update_bucket(&self, settings: &BucketSettings) -> Result<(), ClientError>;
    fn remove_bucket(&self, name: &str) -> Result<(), ClientError>;

    fn create_index(&self, definition: &IndexDefinition) -> Result<(), ClientError>;
    fn get_index(&self, bucket: &str, name: &str) -> Result<Option<IndexInfo>, ClientError>;
    fn drop_index(&self, bucket: &str, name: &str) -> Result<(), ClientError>;

    fn upsert_user(&self, settings: &UserSettings) -> Result<(), ClientError>;
    fn get_user(&self, name: &str) -> Result<Option<UserInfo>, ClientError>;
    fn remove_user(&self, name: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("cluster answered {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Keeps connection and not-found failures distinguishable and wraps everything else with
    /// the failing operation.
    pub fn into_manager(self, op: fn(String) -> ManagerError) -> ManagerError {
        match self {
            ClientError::Connection(message) => ManagerError::Connection(message),
            ClientError::NotFound(message) => ManagerError::NotFound(message),
            other => op(other.to_string()),
        }
    }
}
