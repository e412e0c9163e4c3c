use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::v1::datastore::{DatastoreError, Storage};

/// Keeps tracked resources in process; clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<HashMap<String, Vec<u8>>, DatastoreError> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
    fn save(&self, data: &HashMap<String, Vec<u8>>) -> Result<(), DatastoreError> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = data.clone();
        Ok(())
    }
}
