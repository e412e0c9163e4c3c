//! Cluster double for tests: keeps objects in memory, hides fresh writes from a number of reads
//! to mimic propagation delay, and fails chosen calls on demand.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{
    bucket::{BucketInfo, BucketSettings},
    client::{ClientError, ClusterClient},
    index::{normalize_field, IndexDefinition, IndexInfo, IndexState},
    user::{UserInfo, UserSettings},
};

#[derive(Default)]
struct State {
    buckets: HashMap<String, BucketInfo>,
    indexes: HashMap<String, IndexInfo>,
    users: HashMap<String, UserInfo>,
    /// Remaining invisible reads per object key.
    hidden: HashMap<String, usize>,
    /// Remaining reads per index key that report it as still building.
    building: HashMap<String, usize>,
    failures: HashMap<&'static str, ClientError>,
    writes: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryCluster {
    lag: usize,
    build_reads: usize,
    state: Mutex<State>,
}

impl InMemoryCluster {
    /// Every created object stays invisible for the next `reads` lookups.
    pub fn with_lag(mut self, reads: usize) -> Self {
        self.lag = reads;
        self
    }

    /// Every created index reports `building` for its next `reads` visible lookups.
    pub fn with_index_build(mut self, reads: usize) -> Self {
        self.build_reads = reads;
        self
    }

    /// Adds an index that is visible right away but reports `building` for `building_reads`
    /// lookups. Not recorded as a write.
    pub fn seed_index(&self, definition: &IndexDefinition, building_reads: usize) {
        let key = index_key(&definition.bucket, &definition.name);
        let mut state = self.state();
        state.indexes.insert(key.clone(), index_info(definition));
        if building_reads > 0 {
            state.building.insert(key, building_reads);
        }
    }

    /// Adds a bucket that is visible right away and not recorded as a write.
    pub fn seed_bucket(&self, settings: &BucketSettings) {
        self.state()
            .buckets
            .insert(settings.name.clone(), BucketInfo::from(settings));
    }

    pub fn fail_next(&self, op: &'static str) {
        self.state().failures.insert(
            op,
            ClientError::Rejected {
                status: 500,
                message: format!("injected {op} failure"),
            },
        );
    }

    pub fn fail_next_with_connection(&self, op: &'static str) {
        self.state()
            .failures
            .insert(op, ClientError::Connection("connection refused".to_string()));
    }

    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    fn state(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, op: &'static str, key: &str) -> Result<MutexGuard<State>, ClientError> {
        let mut state = self.state();
        if let Some(err) = state.failures.remove(op) {
            return Err(err);
        }
        state.writes.push(format!("{op} {key}"));
        Ok(state)
    }

    fn read(&self, op: &'static str) -> Result<MutexGuard<State>, ClientError> {
        let mut state = self.state();
        match state.failures.remove(op) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    fn created(&self, state: &mut State, key: String) {
        if self.lag > 0 {
            state.hidden.insert(key, self.lag);
        }
    }
}

/// Counts one read against a hidden object; true while it should stay invisible.
fn still_hidden(state: &mut State, key: &str) -> bool {
    match state.hidden.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn index_info(definition: &IndexDefinition) -> IndexInfo {
    IndexInfo {
        bucket: definition.bucket.clone(),
        name: definition.name.clone(),
        fields: definition.fields.iter().map(|f| normalize_field(f)).collect(),
        is_primary: definition.is_primary(),
        state: IndexState::Online,
    }
}

fn bucket_key(name: &str) -> String {
    format!("bucket:{name}")
}
fn index_key(bucket: &str, name: &str) -> String {
    format!("{bucket}/{name}")
}
fn user_key(name: &str) -> String {
    format!("user:{name}")
}

impl ClusterClient for InMemoryCluster {
    fn get_bucket(&self, name: &str) -> Result<Option<BucketInfo>, ClientError> {
        let mut state = self.read("get_bucket")?;
        if still_hidden(&mut state, &bucket_key(name)) {
            return Ok(None);
        }
        Ok(state.buckets.get(name).cloned())
    }

    fn insert_bucket(&self, settings: &BucketSettings) -> Result<(), ClientError> {
        let mut state = self.write("insert_bucket", &settings.name)?;
        if state.buckets.contains_key(&settings.name) {
            return Err(ClientError::Rejected {
                status: 400,
                message: "Bucket with given name already exists".to_string(),
            });
        }
        state
            .buckets
            .insert(settings.name.clone(), BucketInfo::from(settings));
        self.created(&mut state, bucket_key(&settings.name));
        Ok(())
    }

    fn update_bucket(&self, settings: &BucketSettings) -> Result<(), ClientError> {
        let mut state = self.write("update_bucket", &settings.name)?;
        match state.buckets.get_mut(&settings.name) {
            Some(bucket) => {
                *bucket = BucketInfo::from(settings);
                Ok(())
            }
            None => Err(ClientError::NotFound(settings.name.clone())),
        }
    }

    fn remove_bucket(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.write("remove_bucket", name)?;
        state.buckets.remove(name).ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        state.indexes.retain(|_, index| index.bucket != name);
        Ok(())
    }

    fn create_index(&self, definition: &IndexDefinition) -> Result<(), ClientError> {
        let key = index_key(&definition.bucket, &definition.name);
        let mut state = self.write("create_index", &key)?;
        if !state.buckets.contains_key(&definition.bucket) {
            return Err(ClientError::Rejected {
                status: 404,
                message: format!("Keyspace not found in CB datastore: default:{}", definition.bucket),
            });
        }
        if state.indexes.contains_key(&key) {
            return Err(ClientError::Rejected {
                status: 409,
                message: format!("The index {} already exists.", definition.name),
            });
        }
        state.indexes.insert(key.clone(), index_info(definition));
        if self.build_reads > 0 {
            state.building.insert(key.clone(), self.build_reads);
        }
        self.created(&mut state, key);
        Ok(())
    }

    fn get_index(&self, bucket: &str, name: &str) -> Result<Option<IndexInfo>, ClientError> {
        let key = index_key(bucket, name);
        let mut state = self.read("get_index")?;
        if still_hidden(&mut state, &key) {
            return Ok(None);
        }
        let mut found = state.indexes.get(&key).cloned();
        if let (Some(index), Some(remaining)) = (found.as_mut(), state.building.get_mut(&key)) {
            if *remaining > 0 {
                *remaining -= 1;
                index.state = IndexState::Building;
            }
        }
        Ok(found)
    }

    fn drop_index(&self, bucket: &str, name: &str) -> Result<(), ClientError> {
        let key = index_key(bucket, name);
        let mut state = self.write("drop_index", &key)?;
        state.hidden.remove(&key);
        state.building.remove(&key);
        state
            .indexes
            .remove(&key)
            .map(|_| ())
            .ok_or(ClientError::NotFound(key))
    }

    fn upsert_user(&self, settings: &UserSettings) -> Result<(), ClientError> {
        let mut state = self.write("upsert_user", &settings.name)?;
        let user = UserInfo {
            name: settings.name.clone(),
            roles: settings.roles.clone(),
        };
        if state.users.insert(settings.name.clone(), user).is_none() {
            self.created(&mut state, user_key(&settings.name));
        }
        Ok(())
    }

    fn get_user(&self, name: &str) -> Result<Option<UserInfo>, ClientError> {
        let mut state = self.read("get_user")?;
        if still_hidden(&mut state, &user_key(name)) {
            return Ok(None);
        }
        Ok(state.users.get(name).cloned())
    }

    fn remove_user(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.write("remove_user", name)?;
        state
            .users
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }
}
