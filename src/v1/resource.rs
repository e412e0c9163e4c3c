use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{
    couchbase::ReconcileContext,
    manager::{ManagerError, ResourceManager},
    plan::{item_as_resource, ResourceItem},
    reconciler::{Confirmation, LifecycleState, Reconciler},
    registry::ResourceType,
};

#[derive(Debug, Clone)]
pub struct SharedResource<Input: Clone, Output: Clone> {
    pub resource: Arc<Mutex<Resource<Input, Output>>>,
}

impl<Input, Output> ResourceItem for SharedResource<Input, Output>
where
    Input: Clone + PartialEq + fmt::Debug + 'static,
    Output: Clone + fmt::Debug + 'static,
{
    fn id(&self) -> String {
        self.guard().id.clone()
    }
    fn resource_type(&self) -> ResourceType {
        self.guard().resource_type.clone()
    }
    fn state(&self) -> ResourceState {
        self.guard().state.clone()
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn dependencies(&self) -> HashSet<String> {
        self.guard().dependencies.clone()
    }
    fn ensure_present(
        &self,
        ctx: &ReconcileContext,
        latest: Option<Arc<dyn ResourceItem>>,
    ) -> Result<Confirmation, ResourceError> {
        self.lock()?.ensure_present(ctx, latest)
    }
    fn ensure_absent(&self, ctx: &ReconcileContext) -> Result<(), ResourceError> {
        self.lock()?.ensure_absent(ctx)
    }
    fn apply_bindings(&self) -> Result<(), ResourceError> {
        self.lock()?.apply_bindings()
    }
}

impl<Input: Clone + 'static, Output: Clone + 'static> SharedResource<Input, Output> {
    pub fn new_resource(
        resource_type: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: impl ToString,
        desired: Input,
        state: ResourceState,
    ) -> Self {
        Self::new(Resource::new(resource_type, manager, id, desired, state))
    }
    pub fn new(resource: Resource<Input, Output>) -> Self {
        Self {
            resource: Arc::new(Mutex::new(resource)),
        }
    }

    /// Makes this resource depend on `dependency`: it is reconciled after it, removed before it,
    /// and `bind_fn` copies the dependency's observed state into this resource's desired state.
    pub fn bind<I2: 'static + Clone, O2: 'static + Clone>(
        &self,
        dependency: &SharedResource<I2, O2>,
        bind_fn: impl Fn(&mut Input, &O2) + 'static,
    ) -> Result<(), ResourceError> {
        let dep = dependency.clone();
        let other_id = dep.id()?;
        let other_state = dep.state()?;
        let mut inner = self.lock()?;
        debug!(dependency = %other_id, resource = %inner.id, "Binding observed state");
        inner.dependencies.insert(other_id.clone());
        if let ResourceState::Absent = other_state {
            inner.state = ResourceState::Absent;
            info!(resource = %inner.id, "Dependency is absent, resource will be removed too");
        }
        inner.bindings.push(Bind {
            dep_id: other_id,
            dep_fn: Arc::new(move |desired: &mut Input| {
                dep.with_observed(|observed| bind_fn(desired, observed))
            }),
        });
        Ok(())
    }

    fn guard(&self) -> MutexGuard<Resource<Input, Output>> {
        self.resource.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn lock(&self) -> Result<MutexGuard<Resource<Input, Output>>, ResourceError> {
        self.resource
            .lock()
            .map_err(|err| ResourceError::LockFail(err.to_string()))
    }
    pub fn id(&self) -> Result<String, ResourceError> {
        self.lock().map(|inner| inner.id.clone())
    }
    pub fn state(&self) -> Result<ResourceState, ResourceError> {
        self.lock().map(|inner| inner.state.clone())
    }

    pub fn with_observed(&self, mut apply: impl FnMut(&Output)) -> Result<(), ResourceError> {
        let inner = self.lock()?;
        match &inner.observed {
            Some(observed) => {
                apply(observed);
                Ok(())
            }
            None => Err(ResourceError::DependencyOutputIsMissing(inner.id.clone())),
        }
    }
}

/// One declared cluster object and everything known about its remote counterpart.
#[derive(Clone, Serialize, Deserialize)]
pub struct Resource<Input, Output> {
    pub resource_type: ResourceType,
    /// Plan key, stable across passes. Not the remote identity.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub desired: Input,
    pub observed: Option<Output>,
    /// Remote key of the object this resource tracks, `None` while untracked.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub existence_confirmed: bool,
    #[serde(default)]
    pub lifecycle: LifecycleState,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub state: ResourceState,
    pub dependencies: HashSet<String>,
    #[serde(skip, default = "default_bindings")]
    pub bindings: Vec<Bind<Input>>,
    #[serde(skip, default = "default_manager")]
    pub manager: Option<Arc<dyn ResourceManager<Input, Output>>>,
}
impl<Input: fmt::Debug, Output: fmt::Debug> fmt::Debug for Resource<Input, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("resource_type", &self.resource_type)
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("desired", &self.desired)
            .field("observed", &self.observed)
            .field("existence_confirmed", &self.existence_confirmed)
            .field("lifecycle", &self.lifecycle)
            .field("state", &self.state)
            .field("dependencies", &self.dependencies)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl<Input: Clone + 'static, Output: Clone + 'static> Resource<Input, Output> {
    pub fn new(
        resource_type: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: impl ToString,
        desired: Input,
        state: ResourceState,
    ) -> Self {
        let name = id.to_string();
        let id = format!(
            "{}/{}/{}/{}",
            resource_type.rprovider.name,
            resource_type.rprovider.cluster,
            resource_type.rtype.name,
            &name
        );
        debug!(resource = %id, "New resource");
        Self {
            id,
            name,
            resource_type,
            desired,
            observed: None,
            identity: None,
            existence_confirmed: false,
            lifecycle: LifecycleState::Unmanaged,
            confirmed_at: None,
            state,
            dependencies: Default::default(),
            bindings: Default::default(),
            manager: Some(manager),
        }
    }

    /// Drops local tracking of the remote object.
    pub fn forget(&mut self) {
        self.identity = None;
        self.observed = None;
        self.existence_confirmed = false;
        self.confirmed_at = None;
        self.lifecycle = LifecycleState::Unmanaged;
    }

    /// Carries tracking over from the record persisted by the previous pass.
    fn track_from(&mut self, latest: &Resource<Input, Output>) {
        self.identity = latest.identity.clone();
        self.observed = latest.observed.clone();
        self.existence_confirmed = latest.existence_confirmed;
        self.lifecycle = latest.lifecycle;
        self.confirmed_at = latest.confirmed_at;
    }

    fn manager(&self) -> Result<Arc<dyn ResourceManager<Input, Output>>, ResourceError> {
        self.manager.clone().ok_or(ResourceError::ManagerNotSet)
    }

    fn apply_bindings(&mut self) -> Result<(), ResourceError> {
        let mut desired = self.desired.clone();
        for b in self.bindings.iter() {
            (b.dep_fn)(&mut desired)?;
            debug!(dependency = %b.dep_id, resource = %self.id, "Binding applied");
        }
        self.desired = desired;
        Ok(())
    }
}

impl<Input, Output> Resource<Input, Output>
where
    Input: Clone + PartialEq + 'static,
    Output: Clone + 'static,
{
    fn ensure_present(
        &mut self,
        ctx: &ReconcileContext,
        latest: Option<Arc<dyn ResourceItem>>,
    ) -> Result<Confirmation, ResourceError> {
        let manager = self.manager()?;
        let last_applied = match latest {
            Some(latest) => {
                let latest = item_as_resource::<Input, Output>(latest.as_ref())
                    .ok_or(ResourceError::DowncastFail(self.id.clone()))?;
                self.track_from(&latest);
                Some(latest.desired)
            }
            None => None,
        };
        info!(resource = %self.id, "Ensuring resource is present");
        Reconciler::new(manager.as_ref(), ctx)
            .ensure_present(self, last_applied.as_ref())
            .map_err(ResourceError::ManagerError)
    }

    fn ensure_absent(&mut self, ctx: &ReconcileContext) -> Result<(), ResourceError> {
        let manager = self.manager()?;
        info!(resource = %self.id, "Ensuring resource is absent");
        Reconciler::new(manager.as_ref(), ctx)
            .ensure_absent(self)
            .map_err(ResourceError::ManagerError)
    }
}

pub fn default_manager<Input, Output>() -> Option<Arc<dyn ResourceManager<Input, Output>>> {
    None
}
pub fn default_bindings<Input>() -> Vec<Bind<Input>> {
    vec![]
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum ResourceState {
    Absent,
    #[default]
    Present,
}

type BindFn<Input> = Arc<dyn Fn(&mut Input) -> Result<(), ResourceError>>;

#[derive(Clone)]
pub struct Bind<Input> {
    dep_id: String,
    dep_fn: BindFn<Input>,
}
impl<T> fmt::Debug for Bind<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bind")
            .field("dep_id", &self.dep_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("LockFail: {0}")]
    LockFail(String),
    #[error("DependencyOutputIsMissing: {0} has no observed state yet")]
    DependencyOutputIsMissing(String),
    #[error("DowncastFail: persisted record of {0} has another type")]
    DowncastFail(String),
    #[error("ManagerNotSet")]
    ManagerNotSet,
    #[error("ManagerError: {0}")]
    ManagerError(#[from] ManagerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::couchbase::{
        bucket::{BucketInfo, BucketManager, BucketSettings},
        index::{IndexDefinition, IndexInfo, IndexManager},
    };

    fn bucket(state: ResourceState) -> SharedResource<BucketSettings, BucketInfo> {
        let settings = BucketSettings {
            name: "orders".to_string(),
            ..Default::default()
        };
        SharedResource::new_resource(
            ResourceType::default(),
            BucketManager::arc(),
            "orders",
            settings,
            state,
        )
    }

    fn index() -> SharedResource<IndexDefinition, IndexInfo> {
        let definition = IndexDefinition {
            bucket: "stale".to_string(),
            name: "idx_email".to_string(),
            fields: vec!["email".to_string()],
        };
        SharedResource::new_resource(
            ResourceType::default(),
            IndexManager::arc(),
            "orders/idx_email",
            definition,
            ResourceState::Present,
        )
    }

    #[test]
    fn binding_waits_for_observed_state() {
        let bucket = bucket(ResourceState::Present);
        let index = index();
        index
            .bind(&bucket, |definition, observed: &BucketInfo| {
                definition.bucket = observed.name.clone()
            })
            .unwrap();
        assert!(ResourceItem::dependencies(&index).contains(&ResourceItem::id(&bucket)));
        assert!(matches!(
            ResourceItem::apply_bindings(&index),
            Err(ResourceError::DependencyOutputIsMissing(_))
        ));

        let settings = bucket.guard().desired.clone();
        bucket.guard().observed = Some(BucketInfo::from(&settings));
        ResourceItem::apply_bindings(&index).unwrap();
        assert_eq!(index.guard().desired.bucket, "orders");
    }

    #[test]
    fn absent_dependency_makes_the_dependent_absent() {
        let bucket = bucket(ResourceState::Absent);
        let index = index();
        index.bind(&bucket, |_, _: &BucketInfo| {}).unwrap();
        assert_eq!(ResourceItem::state(&index), ResourceState::Absent);
    }
}
