use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use daggy::{stable_dag::StableDag, NodeIndex};
use petgraph::algo::toposort;
use thiserror::Error;
use tracing::{info, warn};

use super::{
    couchbase::ReconcileContext,
    datastore::{Datastore, DatastoreError},
    manager::{ManagerError, ResourceManager},
    reconciler::Confirmation,
    registry::{ResourceType, SharedRegistry},
    resource::{Resource, ResourceError, ResourceState, SharedResource},
};

#[derive(Clone, Default)]
pub struct SharedPlan {
    inner: Arc<Mutex<Plan>>,
}
impl SharedPlan {
    fn guard(&self) -> MutexGuard<Plan> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn resource<Input, Output>(
        &self,
        rtype: ResourceType,
        mngr: Arc<dyn ResourceManager<Input, Output>>,
        id: &str,
        state: ResourceState,
        desired: Input,
    ) -> Result<SharedResource<Input, Output>, PlanError>
    where
        Input: Clone + PartialEq + fmt::Debug + 'static,
        Output: Clone + fmt::Debug + 'static,
    {
        self.guard().add_resource(rtype, mngr, id, state, desired)
    }
    pub fn apply(
        &self,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
    ) -> Result<PassReport, PlanError> {
        self.guard().apply(datastore, registry, ctx)
    }
    pub fn destroy(
        &self,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
    ) -> Result<PassReport, PlanError> {
        self.guard().destroy(datastore, registry, ctx)
    }
}

/// What one pass did, by plan key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub confirmed: Vec<String>,
    /// Written but not visible yet; retried on the next pass.
    pub pending: Vec<String>,
    /// Skipped because a dependency has no observed state yet.
    pub skipped: Vec<String>,
    pub removed: Vec<String>,
    /// Records kept under another cluster name, left alone.
    pub foreign: Vec<String>,
}

impl PassReport {
    /// Turns the first resource that did not settle into [`ManagerError::PropagationTimeout`].
    pub fn require_settled(&self) -> Result<(), ManagerError> {
        match self.pending.iter().chain(self.skipped.iter()).next() {
            Some(key) => Err(ManagerError::PropagationTimeout(key.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct Plan {
    resources: HashMap<String, Arc<dyn ResourceItem>>,
}

impl Plan {
    pub fn add_resource<Input, Output>(
        &mut self,
        resource_type: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: &str,
        state: ResourceState,
        desired: Input,
    ) -> Result<SharedResource<Input, Output>, PlanError>
    where
        Input: Clone + PartialEq + fmt::Debug + 'static,
        Output: Clone + fmt::Debug + 'static,
    {
        let resource = SharedResource::new_resource(resource_type, manager, id, desired, state);
        let key = ResourceItem::id(&resource);
        if self.resources.contains_key(&key) {
            return Err(PlanError::ResourceAlreadyExists(key));
        }
        self.resources
            .insert(key, Arc::new(resource.clone()) as Arc<dyn ResourceItem>);
        Ok(resource)
    }

    pub fn apply(
        &self,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
    ) -> Result<PassReport, PlanError> {
        info!(resources = self.resources.len(), "Applying plan");
        let sorted = self.toposort()?;
        let mut report = PassReport::default();
        self.apply_absent(datastore, registry, ctx, &sorted, &mut report)?;
        self.apply_present(datastore, registry, ctx, &sorted, &mut report)?;
        Ok(report)
    }

    fn apply_present(
        &self,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
        sorted: &[Arc<dyn ResourceItem>],
        report: &mut PassReport,
    ) -> Result<(), PlanError> {
        for resource in sorted.iter() {
            let id = resource.id();
            if let ResourceState::Absent = resource.state() {
                continue;
            }
            let latest = datastore
                .get(registry, &id)
                .map_err(PlanError::DatastoreError)?;
            match resource.apply_bindings() {
                Ok(()) => {}
                Err(ResourceError::DependencyOutputIsMissing(dep)) => {
                    warn!(resource = %id, dependency = %dep, "Dependency is not visible yet, skipping");
                    report.skipped.push(id);
                    continue;
                }
                Err(err) => return Err(PlanError::ResourceError(err)),
            }
            match resource
                .ensure_present(ctx, latest)
                .map_err(PlanError::ResourceError)?
            {
                Confirmation::Confirmed => report.confirmed.push(id),
                Confirmation::NotYetVisible => report.pending.push(id),
            }
            datastore
                .insert_resource(registry, resource.as_ref())
                .map_err(PlanError::DatastoreError)?;
        }
        Ok(())
    }

    fn apply_absent(
        &self,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
        sorted: &[Arc<dyn ResourceItem>],
        report: &mut PassReport,
    ) -> Result<(), PlanError> {
        // Children go before their parents.
        let mut declared = HashSet::new();
        for resource in sorted.iter().rev() {
            let id = resource.id();
            match resource.state() {
                ResourceState::Absent => {
                    let tracked = datastore
                        .get(registry, &id)
                        .map_err(PlanError::DatastoreError)?;
                    let target = tracked.unwrap_or_else(|| Arc::clone(resource));
                    target
                        .ensure_absent(ctx)
                        .map_err(PlanError::ResourceError)?;
                    datastore.remove(&id);
                    report.removed.push(id);
                }
                ResourceState::Present => {
                    declared.insert(id);
                }
            }
        }
        let undeclared = datastore
            .keys()
            .into_iter()
            .filter(|key| !declared.contains(key))
            .collect();
        self.delete_ids(undeclared, datastore, registry, ctx, report)
    }

    fn delete_ids(
        &self,
        ids: Vec<String>,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
        report: &mut PassReport,
    ) -> Result<(), PlanError> {
        let to_delete = ids.into_iter().try_fold(vec![], |mut acc, key| {
            if let Some(resource) = datastore
                .get(registry, &key)
                .map_err(PlanError::DatastoreError)?
            {
                let owner = resource.resource_type().rprovider.cluster;
                if owner == ctx.cluster {
                    acc.push(resource)
                } else {
                    warn!(resource = %key, cluster = %owner, "Record belongs to another cluster, leaving it");
                    report.foreign.push(key);
                }
            }
            Ok::<_, PlanError>(acc)
        })?;
        let sorted = sort_by_dependencies(&to_delete)?;
        sorted.into_iter().rev().try_for_each(|item| -> Result<(), PlanError> {
            let key = item.id();
            info!(resource = %key, "No longer declared, removing");
            item.ensure_absent(ctx).map_err(PlanError::ResourceError)?;
            datastore.remove(&key);
            report.removed.push(key);
            Ok(())
        })
    }

    pub fn destroy(
        &self,
        datastore: &mut Datastore,
        registry: &SharedRegistry,
        ctx: &ReconcileContext,
    ) -> Result<PassReport, PlanError> {
        info!("Destroying every tracked resource");
        let mut report = PassReport::default();
        self.delete_ids(datastore.keys(), datastore, registry, ctx, &mut report)?;
        Ok(report)
    }

    fn toposort(&self) -> Result<Vec<Arc<dyn ResourceItem>>, PlanError> {
        sort_by_dependencies(
            self.resources
                .values()
                .map(Arc::clone)
                .collect::<Vec<_>>()
                .as_slice(),
        )
    }
}

/// Orders `items` so that every resource comes after the resources it depends on.
/// Dependencies outside `items` are ignored: they are handled by their own pass.
fn sort_by_dependencies(
    items: &[Arc<dyn ResourceItem>],
) -> Result<Vec<Arc<dyn ResourceItem>>, PlanError> {
    let mut idx_id_map = HashMap::<String, NodeIndex>::new();
    let mut dag = StableDag::<Arc<dyn ResourceItem>, u32, u32>::new();
    for resource in items {
        let idx = dag.add_node(Arc::clone(resource));
        idx_id_map.insert(resource.id(), idx);
    }
    for resource in items {
        let idx = idx_id_map[&resource.id()];
        for dep in resource.dependencies() {
            if let Some(dep_idx) = idx_id_map.get(&dep) {
                dag.add_edge(*dep_idx, idx, 0)
                    .map_err(|err| PlanError::DagCreationError(format!("{:?}", err)))?;
            }
        }
    }
    let sorted_indexes = toposort(dag.graph(), None)
        .map_err(|err| PlanError::DagCreationError(format!("{:?}", err)))?;
    Ok(sorted_indexes
        .into_iter()
        .filter_map(|idx| dag.node_weight(idx).map(Arc::clone))
        .collect())
}

pub trait ResourceItem: fmt::Debug {
    fn as_any(&self) -> &dyn std::any::Any;
    fn resource_type(&self) -> ResourceType;
    fn id(&self) -> String;
    fn state(&self) -> ResourceState;
    fn dependencies(&self) -> HashSet<String>;
    fn ensure_present(
        &self,
        ctx: &ReconcileContext,
        latest: Option<Arc<dyn ResourceItem>>,
    ) -> Result<Confirmation, ResourceError>;
    fn ensure_absent(&self, ctx: &ReconcileContext) -> Result<(), ResourceError>;
    fn apply_bindings(&self) -> Result<(), ResourceError>;
}

pub fn item_as_resource<Input: Clone + 'static, Output: Clone + 'static>(
    item: &dyn ResourceItem,
) -> Option<Resource<Input, Output>> {
    item.as_any()
        .downcast_ref::<SharedResource<Input, Output>>()
        .map(|shared| {
            shared
                .resource
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Resource {0} already exists")]
    ResourceAlreadyExists(String),
    #[error("Dag creation error: {0}")]
    DagCreationError(String),
    #[error("Resource error: {0}")]
    ResourceError(ResourceError),
    #[error("Datastore error: {0}")]
    DatastoreError(DatastoreError),
}
