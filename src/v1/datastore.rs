use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::plan::ResourceItem;
use super::registry::{RegistryError, ResourceType, SharedRegistry};

/// Records of every resource a previous pass reconciled, keyed by plan key.
#[derive(Clone)]
pub struct Datastore {
    inner: HashMap<String, Vec<u8>>,
    storage: Arc<dyn Storage + Send + Sync>,
}
pub trait Storage {
    fn load(&self) -> Result<HashMap<String, Vec<u8>>, DatastoreError>;
    fn save(&self, data: &HashMap<String, Vec<u8>>) -> Result<(), DatastoreError>;
}

#[derive(Serialize, Deserialize)]
struct ResourceItemWrapper {
    resource_type: ResourceType,
    resource: Value,
}

impl Datastore {
    pub fn new(storage: impl Storage + 'static + Send + Sync) -> Self {
        Self {
            inner: Default::default(),
            storage: Arc::new(storage),
        }
    }
    pub fn reload(&mut self) -> Result<(), DatastoreError> {
        let data = self
            .storage
            .load()
            .map_err(|e| DatastoreError::LoadError(e.to_string()))?;
        info!(resources = data.len(), "Loaded tracked resources");
        for k in data.keys() {
            debug!(resource = %k, "Loaded from datastore");
        }
        self.inner = data;
        Ok(())
    }
    pub fn save(&self) -> Result<(), DatastoreError> {
        info!(resources = self.inner.len(), "Saving tracked resources");
        self.storage.save(&self.inner)
    }
    pub fn insert_resource(
        &mut self,
        registry: &SharedRegistry,
        resource: &dyn ResourceItem,
    ) -> Result<Option<Vec<u8>>, DatastoreError> {
        let id = resource.id();
        let resource_type = resource.resource_type();
        let wrapper = ResourceItemWrapper {
            resource: registry.serialize_resource(resource, &resource_type)?,
            resource_type,
        };
        let bytes = serde_json::to_vec(&wrapper)?;
        debug!(resource = %id, "Insert into datastore");
        Ok(self.inner.insert(id, bytes))
    }

    pub fn get(
        &self,
        registry: &SharedRegistry,
        id: &str,
    ) -> Result<Option<Arc<dyn ResourceItem>>, DatastoreError> {
        match self.inner.get(id) {
            None => Ok(None),
            Some(data) => {
                let wrapper = serde_json::from_slice::<ResourceItemWrapper>(data)?;
                registry
                    .deserialize_resource(&wrapper.resource, &wrapper.resource_type)
                    .map(Some)
                    .map_err(DatastoreError::RegistryError)
            }
        }
    }
    pub fn remove(&mut self, id: &str) -> Option<Vec<u8>> {
        debug!(resource = %id, "Remove from datastore");
        self.inner.remove(id)
    }
    pub fn keys(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("Load error: {0}")]
    LoadError(String),
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),
    #[error("Serialization or deserialization error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("Serialization or deserialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Registry error: {0}")]
    RegistryError(#[from] RegistryError),
}
