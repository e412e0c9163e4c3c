pub mod bucket;
pub mod client;
pub mod index;
#[cfg(test)]
pub mod memory;
pub mod nodes;
pub mod rest;
pub mod user;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use self::{bucket::Bucket, client::ClusterClient, index::Index, user::User};
use super::{
    config::ProviderConfig,
    confirm::ConfirmationStrategy,
    manager::ResourceManager,
    plan::{PlanError, SharedPlan},
    registry::{
        RProvider, RType, Registry, RegistryError, ResourceSerde, ResourceSerdeProvider,
        ResourceType,
    },
    resource::{ResourceError, ResourceState, SharedResource},
};

pub const PROVIDER_NAME: &str = "couchbase";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum CouchbaseType {
    Bucket,
    Index,
    User,
}

/// Per-kind confirmation strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmations {
    pub bucket: ConfirmationStrategy,
    pub index: ConfirmationStrategy,
    pub user: ConfirmationStrategy,
}

impl Confirmations {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            bucket: ConfirmationStrategy::FixedDelay(config.bucket_creation_delay),
            index: ConfirmationStrategy::Poll {
                timeout: config.index_watch_timeout,
                interval: config.index_poll_interval,
            },
            user: ConfirmationStrategy::FixedDelay(config.user_creation_delay),
        }
    }
}

/// Everything a reconciler operation needs from the outside world, passed explicitly.
#[derive(Clone)]
pub struct ReconcileContext {
    /// Name the cluster's records are kept under. Records of other clusters are never touched.
    pub cluster: String,
    pub client: Arc<dyn ClusterClient>,
    pub confirmations: Confirmations,
}

impl ReconcileContext {
    pub fn new(
        cluster: impl ToString,
        client: Arc<impl ClusterClient + 'static>,
        confirmations: Confirmations,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            client,
            confirmations,
        }
    }
}

impl fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("cluster", &self.cluster)
            .field("confirmations", &self.confirmations)
            .finish()
    }
}

pub struct CouchbaseProvider {
    plan: SharedPlan,
    rprovider: RProvider,
}

#[derive(Clone)]
pub struct CouchbaseResource<'a, Input: Clone, Output: Clone> {
    pub couchbase: &'a CouchbaseProvider,
    pub inner: SharedResource<Input, Output>,
}

impl<'a, Input: Clone + 'static, Output: Clone + 'static> CouchbaseResource<'a, Input, Output> {
    pub fn bind<I2: 'static + Clone, O2: 'static + Clone>(
        &self,
        dep: &CouchbaseResource<'a, I2, O2>,
        bind_fn: impl Fn(&mut Input, &O2) + 'static,
    ) -> Result<(), ResourceError> {
        self.inner.bind(&dep.inner, bind_fn)
    }
}

pub trait CouchbaseResourceCreator {
    type Input: Clone + PartialEq + fmt::Debug + 'static;
    type Output: Clone + fmt::Debug + 'static;
    fn r#type() -> CouchbaseType;
    fn manager() -> Arc<dyn ResourceManager<Self::Input, Self::Output>>;
    /// Fills declaration defaults derived from the plan key.
    fn input_hook(_id: &str, _input: &mut Self::Input) {}
    fn create(
        plan: &SharedPlan,
        rprovider: RProvider,
        id: &str,
        state: ResourceState,
        input: Self::Input,
    ) -> Result<SharedResource<Self::Input, Self::Output>, PlanError> {
        plan.resource(
            ResourceType {
                rprovider,
                rtype: RType {
                    name: Self::r#type().to_string(),
                },
            },
            Self::manager(),
            id,
            state,
            input,
        )
    }
}

impl ResourceSerdeProvider for CouchbaseProvider {
    fn get_resource_serde(
        &self,
        r: &Registry,
        t: &ResourceType,
    ) -> Result<ResourceSerde, RegistryError> {
        match CouchbaseType::from_str(t.rtype.name.as_str())
            .map_err(|_| RegistryError::ResourceTypeNotSupported(t.rtype.name.clone()))?
        {
            CouchbaseType::Bucket => r.serde(Bucket::manager()),
            CouchbaseType::Index => r.serde(Index::manager()),
            CouchbaseType::User => r.serde(User::manager()),
        }
    }
}

impl CouchbaseProvider {
    pub fn new(plan: SharedPlan, rprovider: RProvider) -> Self {
        Self { plan, rprovider }
    }

    /// Declares a resource of kind `C` under the plan key `id`.
    pub fn resource<C: CouchbaseResourceCreator>(
        &self,
        id: &str,
        state: ResourceState,
        mut input: C::Input,
    ) -> Result<CouchbaseResource<C::Input, C::Output>, PlanError> {
        C::input_hook(id, &mut input);
        Ok(CouchbaseResource {
            couchbase: self,
            inner: C::create(&self.plan, self.rprovider.clone(), id, state, input)?,
        })
    }
}
