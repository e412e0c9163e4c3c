use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

use super::{
    bucket::{validate_bucket_name, Bucket},
    CouchbaseResource, CouchbaseResourceCreator, CouchbaseType, ReconcileContext,
};
use crate::v1::{
    confirm::ConfirmationStrategy,
    manager::{ManagerError, ResourceManager, UpdatePolicy},
    resource::ResourceError,
};

pub type IndexInput = IndexDefinition;
pub type IndexOutput = IndexInfo;
pub type Index<'a> = CouchbaseResource<'a, IndexInput, IndexOutput>;

/// A GSI index. An empty field list declares the bucket's primary index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub bucket: String,
    #[serde(default)]
    pub name: String,
    /// Index keys in order, passed verbatim into the statement.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl IndexDefinition {
    pub fn is_primary(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IndexState {
    Online,
    Deferred,
    Pending,
    Building,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub bucket: String,
    pub name: String,
    pub fields: Vec<String>,
    pub is_primary: bool,
    pub state: IndexState,
}

/// Splits an index identity `bucket/name`.
pub fn split_identity(identity: &str) -> Result<(&str, &str), ManagerError> {
    identity
        .split_once('/')
        .filter(|(bucket, name)| !bucket.is_empty() && !name.is_empty())
        .ok_or_else(|| {
            ManagerError::Validation(format!(
                "index identity {identity:?} is not of the form bucket/name"
            ))
        })
}

/// Name the cluster gives a primary index created without one.
pub const DEFAULT_PRIMARY_NAME: &str = "#primary";

fn validate_index_name(name: &str) -> Result<(), ManagerError> {
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_with_letter || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '#' | '-'))
    {
        return Err(ManagerError::Validation(format!(
            "index name {name:?} must start with a letter and contain only letters, digits, \
             '_', '#' and '-'"
        )));
    }
    Ok(())
}

pub struct IndexManager;

impl IndexManager {
    pub fn arc() -> Arc<dyn ResourceManager<IndexInput, IndexOutput>> {
        Arc::new(IndexManager)
    }
}

impl CouchbaseResourceCreator for Index<'_> {
    type Input = IndexInput;
    type Output = IndexOutput;
    fn r#type() -> CouchbaseType {
        CouchbaseType::Index
    }
    fn manager() -> Arc<dyn ResourceManager<Self::Input, Self::Output>> {
        IndexManager::arc()
    }
    fn input_hook(id: &str, input: &mut Self::Input) {
        if input.name.is_empty() {
            input.name = id.rsplit('/').next().unwrap_or(id).to_string();
        }
    }
}

impl<'a> Index<'a> {
    /// Orders the index after its bucket and takes the bucket name from what the cluster reports.
    pub fn bind_bucket(&self, bucket: &Bucket<'a>) -> Result<(), ResourceError> {
        self.bind(bucket, |index, observed| index.bucket = observed.name.clone())
    }
}

impl ResourceManager<IndexInput, IndexOutput> for IndexManager {
    fn kind(&self) -> &'static str {
        "index"
    }

    fn identity(&self, desired: &IndexInput) -> String {
        format!("{}/{}", desired.bucket, desired.name)
    }

    fn validate(&self, desired: &IndexInput) -> Result<(), ManagerError> {
        validate_bucket_name(&desired.bucket)?;
        if !(desired.is_primary() && desired.name == DEFAULT_PRIMARY_NAME) {
            validate_index_name(&desired.name)?;
        }
        if desired.fields.iter().any(|field| field.trim().is_empty()) {
            return Err(ManagerError::Validation(format!(
                "index {} has an empty field",
                desired.name
            )));
        }
        Ok(())
    }

    fn lookup(
        &self,
        ctx: &ReconcileContext,
        identity: &str,
    ) -> Result<Option<IndexOutput>, ManagerError> {
        let (bucket, name) = split_identity(identity)?;
        ctx.client
            .get_index(bucket, name)
            .map_err(|e| e.into_manager(ManagerError::LookupFail))
    }

    fn submit_create(&self, ctx: &ReconcileContext, desired: &IndexInput) -> Result<(), ManagerError> {
        ctx.client
            .create_index(desired)
            .map_err(|e| e.into_manager(ManagerError::CreateFail))
    }

    fn remove(&self, ctx: &ReconcileContext, identity: &str) -> Result<(), ManagerError> {
        let (bucket, name) = split_identity(identity)?;
        ctx.client
            .drop_index(bucket, name)
            .map_err(|e| e.into_manager(ManagerError::DeleteFail))
    }

    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::DropAndRecreate
    }

    fn confirmation<'c>(&self, ctx: &'c ReconcileContext) -> &'c ConfirmationStrategy {
        &ctx.confirmations.index
    }

    fn is_visible(&self, observed: &IndexOutput) -> bool {
        observed.state == IndexState::Online
    }

    fn has_drifted(&self, desired: &IndexInput, observed: &IndexOutput) -> bool {
        if desired.is_primary() || observed.is_primary {
            return desired.is_primary() != observed.is_primary;
        }
        desired.fields.len() != observed.fields.len()
            || desired
                .fields
                .iter()
                .zip(observed.fields.iter())
                .any(|(want, have)| normalize_field(want) != normalize_field(have))
    }
}

/// Field expressions as the index service echoes them back, without quoting or spacing.
pub fn normalize_field(field: &str) -> String {
    field
        .chars()
        .filter(|c| *c != '`' && !c.is_whitespace())
        .collect()
}
