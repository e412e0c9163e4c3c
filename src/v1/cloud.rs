use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use super::{
    couchbase::{CouchbaseProvider, ReconcileContext, PROVIDER_NAME},
    datastore::{Datastore, DatastoreError},
    plan::{PassReport, PlanError, SharedPlan},
    registry::{RProvider, RegistryError, ResourceSerdeProvider, SharedRegistry},
};

/// Declared resources, their persisted records and the cluster they are reconciled against.
pub struct CbCloud {
    plan: SharedPlan,
    datastore: Datastore,
    registry: Option<SharedRegistry>,
    context: ReconcileContext,
}

impl CbCloud {
    pub fn new(datastore: Datastore, context: ReconcileContext) -> Self {
        Self {
            plan: SharedPlan::default(),
            datastore,
            registry: None,
            context,
        }
    }

    pub fn init_registry(&mut self) {
        let plan = self.plan.clone();
        self.registry = Some(SharedRegistry::new(Box::new(
            move |r| -> Result<Arc<Mutex<dyn ResourceSerdeProvider>>, RegistryError> {
                if r.name == PROVIDER_NAME {
                    Ok(
                        Arc::new(Mutex::new(CouchbaseProvider::new(plan.clone(), r.clone())))
                            as Arc<Mutex<dyn ResourceSerdeProvider>>,
                    )
                } else {
                    Err(RegistryError::ProviderNotFound(r.name.to_string()))
                }
            },
        )));
    }

    /// Provider declaring into this cloud's plan, keyed by the context's cluster name.
    pub fn couchbase_provider(&self) -> CouchbaseProvider {
        CouchbaseProvider::new(
            self.plan.clone(),
            RProvider {
                name: PROVIDER_NAME.to_string(),
                cluster: self.context.cluster.clone(),
            },
        )
    }

    pub fn apply(&mut self) -> Result<PassReport, CloudError> {
        self.datastore.reload()?;
        let result = match self.registry.as_ref() {
            Some(registry) => self
                .plan
                .apply(&mut self.datastore, registry, &self.context)
                .map_err(CloudError::PlanError),
            None => Err(CloudError::RegistryNotInitialized),
        };
        // Whatever was reconciled before a failure stays tracked.
        self.datastore.save()?;
        let report = result?;
        info!(
            confirmed = report.confirmed.len(),
            pending = report.pending.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            foreign = report.foreign.len(),
            "Apply finished"
        );
        Ok(report)
    }

    pub fn destroy(&mut self) -> Result<PassReport, CloudError> {
        self.datastore.reload()?;
        let result = match self.registry.as_ref() {
            Some(registry) => self
                .plan
                .destroy(&mut self.datastore, registry, &self.context)
                .map_err(CloudError::PlanError),
            None => Err(CloudError::RegistryNotInitialized),
        };
        self.datastore.save()?;
        let report = result?;
        info!(removed = report.removed.len(), "Destroy finished");
        Ok(report)
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("DatastoreError: {0}")]
    DatastoreError(#[from] DatastoreError),
    #[error("PlanError: {0}")]
    PlanError(PlanError),
    #[error("Registry not initialized")]
    RegistryNotInitialized,
}
