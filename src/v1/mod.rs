pub mod cloud;
pub mod config;
pub mod confirm;
pub mod couchbase;
pub mod datastore;
pub mod manager;
pub mod manifest;
pub mod plan;
pub mod reconciler;
pub mod registry;
pub mod resource;
pub mod storage;
