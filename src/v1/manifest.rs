//! JSON declaration of the buckets, indexes and users a cluster should have.
//!
//! ```json
//! {
//!   "buckets": [{ "name": "orders", "type": 0, "quota": 120, "replicas": 1 }],
//!   "indexes": [{ "bucket": "orders", "name": "idx_email", "fields": ["email"] }],
//!   "users": [{ "name": "reporter", "password": "secret", "roles": ["bucket_admin:orders"] }]
//! }
//! ```
//!
//! Every entry may carry `"state": "Absent"` to have the object removed.

use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{
    couchbase::{
        bucket::{Bucket, BucketSettings},
        index::{Index, IndexDefinition},
        user::{User, UserSettings},
        CouchbaseProvider,
    },
    plan::PlanError,
    resource::{ResourceError, ResourceState},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declared<T> {
    #[serde(flatten)]
    pub settings: T,
    #[serde(default)]
    pub state: ResourceState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub buckets: Vec<Declared<BucketSettings>>,
    #[serde(default)]
    pub indexes: Vec<Declared<IndexDefinition>>,
    #[serde(default)]
    pub users: Vec<Declared<UserSettings>>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| ManifestError::Io(path.display().to_string(), e))?;
        let manifest = Self::parse(&raw)?;
        info!(
            path = %path.display(),
            buckets = manifest.buckets.len(),
            indexes = manifest.indexes.len(),
            users = manifest.users.len(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(raw)?;
        manifest.check_names()?;
        Ok(manifest)
    }

    fn check_names(&self) -> Result<(), ManifestError> {
        let unnamed = self.buckets.iter().any(|b| b.settings.name.trim().is_empty())
            || self
                .indexes
                .iter()
                .any(|i| i.settings.name.trim().is_empty() || i.settings.bucket.trim().is_empty())
            || self.users.iter().any(|u| u.settings.name.trim().is_empty());
        if unnamed {
            return Err(ManifestError::Unnamed);
        }
        Ok(())
    }

    /// Adds every entry to the provider's plan. Indexes on a declared bucket are bound to it.
    pub fn declare(&self, couchbase: &CouchbaseProvider) -> Result<(), ManifestError> {
        let mut buckets = HashMap::new();
        for entry in &self.buckets {
            let name = entry.settings.name.clone();
            let bucket =
                couchbase.resource::<Bucket>(&name, entry.state.clone(), entry.settings.clone())?;
            buckets.insert(name, bucket);
        }
        for entry in &self.indexes {
            let id = format!("{}/{}", entry.settings.bucket, entry.settings.name);
            let index =
                couchbase.resource::<Index>(&id, entry.state.clone(), entry.settings.clone())?;
            if let Some(bucket) = buckets.get(&entry.settings.bucket) {
                debug!(index = %id, "Bound to declared bucket");
                index.bind_bucket(bucket)?;
            }
        }
        for entry in &self.users {
            couchbase.resource::<User>(
                &entry.settings.name,
                entry.state.clone(),
                entry.settings.clone(),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Could not read manifest {0}: {1}")]
    Io(String, std::io::Error),
    #[error("Invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Every bucket, index and user needs a name, and every index a bucket")]
    Unnamed,
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}
