use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{CouchbaseResource, CouchbaseResourceCreator, CouchbaseType, ReconcileContext};
use crate::v1::{
    confirm::ConfirmationStrategy,
    manager::{ManagerError, ResourceManager},
};

pub type BucketInput = BucketSettings;
pub type BucketOutput = BucketInfo;
pub type Bucket<'a> = CouchbaseResource<'a, BucketInput, BucketOutput>;

pub const MIN_QUOTA_MB: u64 = 100;
pub const MAX_REPLICAS: u8 = 3;
const MAX_NAME_LEN: usize = 100;

/// Storage engine of a bucket. Declared as 0, 1 or 2.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(try_from = "u8", into = "u8")]
#[strum(ascii_case_insensitive)]
pub enum BucketKind {
    #[default]
    #[strum(to_string = "couchbase", serialize = "membase")]
    Couchbase,
    #[strum(to_string = "memcached")]
    Memcached,
    #[strum(to_string = "ephemeral")]
    Ephemeral,
}

impl TryFrom<u8> for BucketKind {
    type Error = ManagerError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BucketKind::Couchbase),
            1 => Ok(BucketKind::Memcached),
            2 => Ok(BucketKind::Ephemeral),
            other => Err(ManagerError::Validation(format!(
                "bucket type {other} is invalid. Valid values are: \
                 0 (Couchbase), 1 (Memcached), 2 (Ephemeral)"
            ))),
        }
    }
}

impl From<BucketKind> for u8 {
    fn from(kind: BucketKind) -> Self {
        match kind {
            BucketKind::Couchbase => 0,
            BucketKind::Memcached => 1,
            BucketKind::Ephemeral => 2,
        }
    }
}

impl BucketKind {
    /// Memcached buckets have neither replicas nor index replicas.
    pub fn replicated(&self) -> bool {
        !matches!(self, BucketKind::Memcached)
    }
}

fn default_quota() -> u64 {
    MIN_QUOTA_MB
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "type")]
    pub kind: BucketKind,
    /// RAM quota per node, in MB.
    #[serde(default = "default_quota")]
    pub quota: u64,
    #[serde(default)]
    pub replicas: u8,
    #[serde(default)]
    pub flush_enabled: bool,
    #[serde(default)]
    pub index_replicas: bool,
    /// Legacy SASL password, only sent when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: BucketKind::default(),
            quota: MIN_QUOTA_MB,
            replicas: 0,
            flush_enabled: false,
            index_replicas: false,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub kind: BucketKind,
    pub quota: u64,
    pub replicas: u8,
    pub flush_enabled: bool,
    pub index_replicas: bool,
}

impl From<&BucketSettings> for BucketInfo {
    fn from(settings: &BucketSettings) -> Self {
        Self {
            name: settings.name.clone(),
            kind: settings.kind,
            quota: settings.quota,
            replicas: settings.replicas,
            flush_enabled: settings.flush_enabled,
            index_replicas: settings.index_replicas,
        }
    }
}

pub struct BucketManager;

impl BucketManager {
    pub fn arc() -> Arc<dyn ResourceManager<BucketInput, BucketOutput>> {
        Arc::new(BucketManager)
    }
}

impl CouchbaseResourceCreator for Bucket<'_> {
    type Input = BucketInput;
    type Output = BucketOutput;
    fn r#type() -> CouchbaseType {
        CouchbaseType::Bucket
    }
    fn manager() -> Arc<dyn ResourceManager<Self::Input, Self::Output>> {
        BucketManager::arc()
    }
    fn input_hook(id: &str, input: &mut Self::Input) {
        if input.name.is_empty() {
            input.name = id.to_string();
        }
    }
}

pub(crate) fn validate_bucket_name(name: &str) -> Result<(), ManagerError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ManagerError::Validation(format!(
            "bucket name {name:?} must be 1 to {MAX_NAME_LEN} characters long"
        )));
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '%' | '_' | '-'))
    {
        return Err(ManagerError::Validation(format!(
            "bucket name {name:?} may only contain letters, digits, '.', '%', '_' and '-' \
             and must not start with '.'"
        )));
    }
    Ok(())
}

impl ResourceManager<BucketInput, BucketOutput> for BucketManager {
    fn kind(&self) -> &'static str {
        "bucket"
    }

    fn identity(&self, desired: &BucketInput) -> String {
        desired.name.clone()
    }

    fn validate(&self, desired: &BucketInput) -> Result<(), ManagerError> {
        validate_bucket_name(&desired.name)?;
        if desired.quota < MIN_QUOTA_MB {
            return Err(ManagerError::Validation(format!(
                "bucket {} quota must be at least {MIN_QUOTA_MB} MB, got {}",
                desired.name, desired.quota
            )));
        }
        if desired.replicas > MAX_REPLICAS {
            return Err(ManagerError::Validation(format!(
                "bucket {} replicas must be between 0 and {MAX_REPLICAS}, got {}",
                desired.name, desired.replicas
            )));
        }
        Ok(())
    }

    fn lookup(
        &self,
        ctx: &ReconcileContext,
        identity: &str,
    ) -> Result<Option<BucketOutput>, ManagerError> {
        ctx.client
            .get_bucket(identity)
            .map_err(|e| e.into_manager(ManagerError::LookupFail))
    }

    fn submit_create(&self, ctx: &ReconcileContext, desired: &BucketInput) -> Result<(), ManagerError> {
        ctx.client
            .insert_bucket(desired)
            .map_err(|e| e.into_manager(ManagerError::CreateFail))
    }

    fn submit_update(&self, ctx: &ReconcileContext, desired: &BucketInput) -> Result<(), ManagerError> {
        ctx.client
            .update_bucket(desired)
            .map_err(|e| e.into_manager(ManagerError::UpdateFail))
    }

    fn remove(&self, ctx: &ReconcileContext, identity: &str) -> Result<(), ManagerError> {
        ctx.client
            .remove_bucket(identity)
            .map_err(|e| e.into_manager(ManagerError::DeleteFail))
    }

    fn confirmation<'c>(&self, ctx: &'c ReconcileContext) -> &'c ConfirmationStrategy {
        &ctx.confirmations.bucket
    }

    fn has_drifted(&self, desired: &BucketInput, observed: &BucketOutput) -> bool {
        let replicas_differ = desired.kind.replicated()
            && (desired.replicas != observed.replicas
                || desired.index_replicas != observed.index_replicas);
        desired.kind != observed.kind
            || desired.quota != observed.quota
            || desired.flush_enabled != observed.flush_enabled
            || replicas_differ
    }
}
