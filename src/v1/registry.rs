use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{
    manager::ResourceManager,
    plan::ResourceItem,
    resource::{Resource, SharedResource},
};

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct RProvider {
    pub name: String,
    /// Configured cluster name the resources are recorded under.
    pub cluster: String,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct RType {
    pub name: String,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct ResourceType {
    pub rprovider: RProvider,
    pub rtype: RType,
}

type Serializer = Arc<dyn Fn(&dyn ResourceItem) -> Result<Value, RegistryError> + Sync + Send>;
type Deserializer =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn ResourceItem>, RegistryError> + Sync + Send>;

/// Turns persisted records back into live resources with their manager attached.
pub struct ResourceSerde {
    serializer: Serializer,
    deserializer: Deserializer,
}

pub trait ResourceSerdeProvider {
    fn get_resource_serde(
        &self,
        registry: &Registry,
        rt: &ResourceType,
    ) -> Result<ResourceSerde, RegistryError>;
}

#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SharedRegistry {
    pub fn new(provider_factory: ProviderFactory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::new(provider_factory))),
        }
    }
    fn guard(&self) -> MutexGuard<Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn serialize_resource(
        &self,
        resource: &dyn ResourceItem,
        resource_type: &ResourceType,
    ) -> Result<Value, RegistryError> {
        self.guard().serialize_resource(resource, resource_type)
    }
    pub fn deserialize_resource(
        &self,
        value: &Value,
        resource_type: &ResourceType,
    ) -> Result<Arc<dyn ResourceItem>, RegistryError> {
        self.guard().deserialize_resource(value, resource_type)
    }
}

pub type ProviderFactory =
    Box<dyn Fn(&RProvider) -> Result<Arc<Mutex<dyn ResourceSerdeProvider>>, RegistryError>>;

pub struct Registry {
    serde_store: HashMap<ResourceType, ResourceSerde>,
    provider_store: HashMap<RProvider, Arc<Mutex<dyn ResourceSerdeProvider>>>,
    provider_factory: ProviderFactory,
}

impl Registry {
    pub fn new(provider_factory: ProviderFactory) -> Self {
        Self {
            serde_store: HashMap::new(),
            provider_store: HashMap::new(),
            provider_factory,
        }
    }

    pub fn serde<Input, Output>(
        &self,
        mngr: Arc<dyn ResourceManager<Input, Output>>,
    ) -> Result<ResourceSerde, RegistryError>
    where
        Input: 'static + Serialize + for<'de> Deserialize<'de> + Clone + PartialEq + fmt::Debug,
        Output: 'static + Serialize + for<'de> Deserialize<'de> + Clone + fmt::Debug,
    {
        let serializer: Serializer = Arc::new(
            move |res: &dyn ResourceItem| -> Result<Value, RegistryError> {
                let res: Resource<Input, Output> = res
                    .as_any()
                    .downcast_ref::<SharedResource<Input, Output>>()
                    .ok_or(RegistryError::DowncastError)?
                    .resource
                    .lock()
                    .map_err(|_| RegistryError::LockResourceError)?
                    .clone();
                serde_json::to_value(res).map_err(RegistryError::SerializationError)
            },
        );
        let deserializer: Deserializer = Arc::new(
            move |value: &Value| -> Result<Arc<dyn ResourceItem>, RegistryError> {
                serde_json::from_value(value.clone())
                    .map(|mut resource: Resource<Input, Output>| {
                        resource.manager = Some(Arc::clone(&mngr));
                        Arc::new(SharedResource::new(resource)) as Arc<dyn ResourceItem>
                    })
                    .map_err(RegistryError::SerializationError)
            },
        );
        Ok(ResourceSerde {
            serializer,
            deserializer,
        })
    }

    pub fn register_type(
        &mut self,
        resource_type: &ResourceType,
        resource_serde: ResourceSerde,
    ) -> Result<(), RegistryError> {
        match self
            .serde_store
            .insert(resource_type.clone(), resource_serde)
        {
            Some(_) => Err(RegistryError::TypeRegisteredAlready(format!(
                "{:?}",
                resource_type
            ))),
            None => Ok(()),
        }
    }

    pub fn serialize_resource(
        &mut self,
        resource: &dyn ResourceItem,
        resource_type: &ResourceType,
    ) -> Result<Value, RegistryError> {
        (self.serde_for(resource_type)?.serializer)(resource)
    }

    pub fn deserialize_resource(
        &mut self,
        value: &Value,
        resource_type: &ResourceType,
    ) -> Result<Arc<dyn ResourceItem>, RegistryError> {
        (self.serde_for(resource_type)?.deserializer)(value)
    }

    fn serde_for(&mut self, resource_type: &ResourceType) -> Result<&ResourceSerde, RegistryError> {
        if !self.serde_store.contains_key(resource_type) {
            let provider = self.provider_for(&resource_type.rprovider)?;
            let resource_serde = provider
                .lock()
                .map_err(|_| RegistryError::LockResourceError)?
                .get_resource_serde(self, resource_type)?;
            debug!(kind = %resource_type.rtype.name, "Registered resource type");
            self.register_type(resource_type, resource_serde)?;
        }
        self.serde_store.get(resource_type).ok_or_else(|| {
            RegistryError::TypeNotRegistered(format!(
                "Provider: {}, Cluster: {}, Type: {}",
                resource_type.rprovider.name,
                resource_type.rprovider.cluster,
                resource_type.rtype.name
            ))
        })
    }

    fn provider_for(
        &mut self,
        rprovider: &RProvider,
    ) -> Result<Arc<Mutex<dyn ResourceSerdeProvider>>, RegistryError> {
        if let Some(provider) = self.provider_store.get(rprovider) {
            return Ok(Arc::clone(provider));
        }
        let provider = (self.provider_factory)(rprovider)?;
        self.provider_store
            .insert(rprovider.clone(), Arc::clone(&provider));
        Ok(provider)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("DowncastError, could not downcast to SharedResource")]
    DowncastError,
    #[error("TypeNotRegistered, provider was not able to register resource: {0}")]
    TypeNotRegistered(String),
    #[error("TypeRegisteredAlready: {0}")]
    TypeRegisteredAlready(String),
    #[error("ProviderNotFound, provider factory has no provider named {0}")]
    ProviderNotFound(String),
    #[error("LockResourceError, could not lock resource")]
    LockResourceError,
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Unknown Type to register {0}")]
    ResourceTypeNotSupported(String),
}
