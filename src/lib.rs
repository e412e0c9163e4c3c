pub mod v1;

pub mod prelude {
    pub use crate::v1::cloud::*;
    pub use crate::v1::config::*;
    pub use crate::v1::confirm::*;
    pub use crate::v1::couchbase::{
        bucket::*, client::*, index::*, nodes::*, rest::*, user::*, *,
    };
    pub use crate::v1::datastore::Datastore;
    pub use crate::v1::manifest::*;
    pub use crate::v1::plan::PassReport;
    pub use crate::v1::reconciler::{Confirmation, LifecycleState};
    pub use crate::v1::resource::{ResourceState::*, *};
    pub use crate::v1::storage::{file::FileStorage, memory::MemoryStorage};
}
