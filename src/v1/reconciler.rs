//! Lifecycle driver for one resource on an eventually-consistent cluster.
//!
//! A write accepted by the cluster is not necessarily readable right away, so every create and
//! update ends with a confirmation phase governed by the kind's [`ConfirmationStrategy`]. Running
//! out of that budget is not an error: the resource is dropped from local tracking and the next
//! pass picks it up again.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{
    confirm::ConfirmationStrategy,
    couchbase::ReconcileContext,
    manager::{ManagerError, ResourceManager, UpdatePolicy},
    resource::Resource,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Unmanaged,
    Creating,
    Unconfirmed,
    Confirmed,
    Updating,
    Deleting,
    Failed,
}

/// Outcome of the confirmation phase that closes a create or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    /// The write succeeded but no read saw it within the budget. Identity has been cleared.
    NotYetVisible,
}

pub struct Reconciler<'a, Input, Output> {
    manager: &'a dyn ResourceManager<Input, Output>,
    ctx: &'a ReconcileContext,
}

impl<'a, Input, Output> Reconciler<'a, Input, Output>
where
    Input: Clone + PartialEq + 'static,
    Output: Clone + 'static,
{
    pub fn new(manager: &'a dyn ResourceManager<Input, Output>, ctx: &'a ReconcileContext) -> Self {
        Self { manager, ctx }
    }

    fn strategy(&self) -> &ConfirmationStrategy {
        self.manager.confirmation(self.ctx)
    }

    fn desired_identity(&self, resource: &Resource<Input, Output>) -> Result<String, ManagerError> {
        let identity = self.manager.identity(&resource.desired);
        if identity.trim().is_empty() {
            return Err(ManagerError::Validation(format!(
                "{} identity must not be empty",
                self.manager.kind()
            )));
        }
        Ok(identity)
    }

    pub fn create(&self, resource: &mut Resource<Input, Output>) -> Result<Confirmation, ManagerError> {
        let identity = self.desired_identity(resource)?;
        if let Some(tracked) = resource.identity.as_ref() {
            return Err(ManagerError::Validation(format!(
                "{} {} is already managed",
                self.manager.kind(),
                tracked
            )));
        }
        self.manager.validate(&resource.desired)?;

        resource.lifecycle = LifecycleState::Creating;
        if let Err(err) = self.manager.submit_create(self.ctx, &resource.desired) {
            error!(kind = self.manager.kind(), %identity, %err, "Create was rejected");
            resource.lifecycle = LifecycleState::Failed;
            return Err(err);
        }
        info!(kind = self.manager.kind(), %identity, "Created");
        resource.identity = Some(identity);
        resource.existence_confirmed = false;
        resource.lifecycle = LifecycleState::Unconfirmed;
        self.confirm(resource)
    }

    /// Plain lookup. `Ok(None)` means absent; failures to reach the cluster are errors.
    pub fn read(&self, identity: &str) -> Result<Option<Output>, ManagerError> {
        info!(kind = self.manager.kind(), %identity, "Reading");
        self.manager.lookup(self.ctx, identity)
    }

    pub fn update(&self, resource: &mut Resource<Input, Output>) -> Result<Confirmation, ManagerError> {
        let identity = self.desired_identity(resource)?;
        match resource.identity.as_deref() {
            Some(tracked) if tracked == identity => {}
            Some(tracked) => {
                return Err(ManagerError::Validation(format!(
                    "{} identity is immutable: {} cannot become {}",
                    self.manager.kind(),
                    tracked,
                    identity
                )))
            }
            None => {
                return Err(ManagerError::Validation(format!(
                    "{} {} is not managed and cannot be updated",
                    self.manager.kind(),
                    identity
                )))
            }
        }
        self.manager.validate(&resource.desired)?;

        resource.lifecycle = LifecycleState::Updating;
        match self.manager.update_policy() {
            UpdatePolicy::Upsert => {
                if let Err(err) = self.manager.submit_update(self.ctx, &resource.desired) {
                    error!(kind = self.manager.kind(), %identity, %err, "Update was rejected");
                    resource.lifecycle = LifecycleState::Failed;
                    return Err(err);
                }
            }
            UpdatePolicy::DropAndRecreate => {
                self.remove(resource, &identity)?;
                resource.lifecycle = LifecycleState::Creating;
                if let Err(err) = self.manager.submit_create(self.ctx, &resource.desired) {
                    error!(
                        kind = self.manager.kind(),
                        %identity,
                        %err,
                        "Recreate failed after drop, resource is now absent"
                    );
                    resource.lifecycle = LifecycleState::Failed;
                    return Err(ManagerError::PartialUpdate {
                        identity,
                        source: Box::new(err),
                    });
                }
                resource.identity = Some(identity.clone());
            }
        }
        info!(kind = self.manager.kind(), %identity, "Updated");
        resource.existence_confirmed = false;
        resource.lifecycle = LifecycleState::Unconfirmed;
        self.confirm(resource)
    }

    /// Idempotent: a cluster that no longer knows the object counts as success.
    pub fn delete(&self, resource: &mut Resource<Input, Output>) -> Result<(), ManagerError> {
        let identity = match resource.identity.clone() {
            Some(identity) => identity,
            None => self.desired_identity(resource)?,
        };
        self.remove(resource, &identity)
    }

    fn remove(&self, resource: &mut Resource<Input, Output>, identity: &str) -> Result<(), ManagerError> {
        resource.lifecycle = LifecycleState::Deleting;
        match self.manager.remove(self.ctx, identity) {
            Ok(()) => info!(kind = self.manager.kind(), %identity, "Removed"),
            Err(err) if err.is_not_found() => {
                info!(kind = self.manager.kind(), %identity, "Already absent")
            }
            Err(err) => {
                error!(kind = self.manager.kind(), %identity, %err, "Remove was rejected");
                resource.lifecycle = LifecycleState::Failed;
                return Err(err);
            }
        }
        resource.forget();
        Ok(())
    }

    fn confirm(&self, resource: &mut Resource<Input, Output>) -> Result<Confirmation, ManagerError> {
        let identity = resource.identity.clone().unwrap_or_default();
        let seen = self
            .strategy()
            .confirm(|| {
                self.manager.lookup(self.ctx, &identity).map(|found| {
                    found.filter(|observed| self.manager.is_visible(observed))
                })
            })
            .inspect_err(|_| resource.lifecycle = LifecycleState::Failed)?;
        match seen {
            Some(observed) => {
                info!(kind = self.manager.kind(), %identity, "Confirmed");
                resource.observed = Some(observed);
                resource.existence_confirmed = true;
                resource.confirmed_at = Some(Utc::now());
                resource.lifecycle = LifecycleState::Confirmed;
                Ok(Confirmation::Confirmed)
            }
            None => {
                warn!(
                    kind = self.manager.kind(),
                    %identity,
                    budget = ?self.strategy().budget(),
                    "Not visible yet, it will be picked up on the next pass"
                );
                resource.forget();
                Ok(Confirmation::NotYetVisible)
            }
        }
    }

    /// Brings the remote object in line with `resource.desired`.
    ///
    /// Adopts an existing object with the desired identity once it passes the kind's visibility
    /// rule, confirming it first when it does not yet. Replaces the tracked object when the
    /// identity changed, updates when the desired state differs from `last_applied` or from what
    /// the cluster reports, and creates when nothing is there.
    pub fn ensure_present(
        &self,
        resource: &mut Resource<Input, Output>,
        last_applied: Option<&Input>,
    ) -> Result<Confirmation, ManagerError> {
        let identity = self.desired_identity(resource)?;
        if let Some(tracked) = resource.identity.clone() {
            if tracked != identity {
                info!(kind = self.manager.kind(), from = %tracked, to = %identity, "Identity changed, replacing");
                self.delete(resource)?;
            }
        }
        match self.read(&identity)? {
            None => {
                resource.forget();
                self.create(resource)
            }
            Some(observed) => {
                resource.identity = Some(identity.clone());
                if self.manager.is_visible(&observed) {
                    resource.observed = Some(observed);
                    resource.existence_confirmed = true;
                    resource.lifecycle = LifecycleState::Confirmed;
                } else {
                    info!(kind = self.manager.kind(), %identity, "Found but not usable yet, confirming");
                    resource.observed = None;
                    resource.existence_confirmed = false;
                    resource.lifecycle = LifecycleState::Unconfirmed;
                    if self.confirm(resource)? == Confirmation::NotYetVisible {
                        return Ok(Confirmation::NotYetVisible);
                    }
                }
                let drifted = last_applied.map_or(false, |last| *last != resource.desired)
                    || resource
                        .observed
                        .as_ref()
                        .is_some_and(|observed| self.manager.has_drifted(&resource.desired, observed));
                if drifted {
                    self.update(resource)
                } else {
                    Ok(Confirmation::Confirmed)
                }
            }
        }
    }

    pub fn ensure_absent(&self, resource: &mut Resource<Input, Output>) -> Result<(), ManagerError> {
        self.delete(resource)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::v1::{
        couchbase::{
            bucket::{BucketKind, BucketManager, BucketSettings},
            index::{IndexDefinition, IndexManager, IndexState},
            memory::InMemoryCluster,
            user::{UserManager, UserRole, UserSettings},
            Confirmations,
        },
        registry::ResourceType,
        resource::ResourceState,
    };

    fn context(cluster: &Arc<InMemoryCluster>) -> ReconcileContext {
        ReconcileContext::new(
            "default",
            cluster.clone(),
            Confirmations {
                bucket: ConfirmationStrategy::FixedDelay(Duration::ZERO),
                index: ConfirmationStrategy::Poll {
                    timeout: Duration::from_millis(200),
                    interval: Duration::from_millis(1),
                },
                user: ConfirmationStrategy::FixedDelay(Duration::ZERO),
            },
        )
    }

    fn orders() -> BucketSettings {
        BucketSettings {
            name: "orders".to_string(),
            quota: 120,
            replicas: 1,
            ..Default::default()
        }
    }

    fn idx_email(fields: &[&str]) -> IndexDefinition {
        IndexDefinition {
            bucket: "orders".to_string(),
            name: "idx_email".to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn resource<I: Clone + 'static, O: Clone + 'static>(
        manager: Arc<dyn ResourceManager<I, O>>,
        desired: I,
    ) -> Resource<I, O> {
        Resource::new(ResourceType::default(), manager, "test", desired, ResourceState::Present)
    }

    #[test]
    fn create_bucket_is_confirmed_by_read() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut bucket = resource(manager.clone(), orders());

        assert_eq!(reconciler.create(&mut bucket).unwrap(), Confirmation::Confirmed);
        assert!(bucket.existence_confirmed);
        assert_eq!(bucket.lifecycle, LifecycleState::Confirmed);
        assert_eq!(bucket.identity.as_deref(), Some("orders"));

        let observed = reconciler.read("orders").unwrap().unwrap();
        assert_eq!(observed.name, "orders");
        assert_eq!(observed.quota, 120);
        assert_eq!(observed.replicas, 1);
        assert!(!observed.flush_enabled);
        assert_eq!(cluster.writes(), vec!["insert_bucket orders".to_string()]);
    }

    #[test]
    fn invisible_create_clears_identity_without_failing() {
        let cluster = Arc::new(InMemoryCluster::default().with_lag(5));
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut bucket = resource(manager.clone(), orders());

        assert_eq!(reconciler.create(&mut bucket).unwrap(), Confirmation::NotYetVisible);
        assert_eq!(bucket.identity, None);
        assert!(!bucket.existence_confirmed);
        assert_eq!(bucket.lifecycle, LifecycleState::Unmanaged);
    }

    #[test]
    fn next_pass_adopts_a_late_object() {
        let cluster = Arc::new(InMemoryCluster::default().with_lag(1));
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut bucket = resource(manager.clone(), orders());

        assert_eq!(reconciler.create(&mut bucket).unwrap(), Confirmation::NotYetVisible);
        assert_eq!(
            reconciler.ensure_present(&mut bucket, None).unwrap(),
            Confirmation::Confirmed
        );
        assert!(bucket.existence_confirmed);
        assert_eq!(cluster.writes(), vec!["insert_bucket orders".to_string()]);
    }

    #[test]
    fn create_rejects_tracked_or_empty_identity() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);

        let mut unnamed = resource(manager.clone(), BucketSettings::default());
        assert!(matches!(
            reconciler.create(&mut unnamed),
            Err(ManagerError::Validation(_))
        ));

        let mut tracked = resource(manager.clone(), orders());
        tracked.identity = Some("orders".to_string());
        assert!(matches!(
            reconciler.create(&mut tracked),
            Err(ManagerError::Validation(_))
        ));
        assert!(cluster.writes().is_empty());
    }

    #[test]
    fn invalid_settings_never_reach_the_cluster() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut bucket = resource(
            manager.clone(),
            BucketSettings {
                replicas: 4,
                ..orders()
            },
        );
        assert!(matches!(
            reconciler.create(&mut bucket),
            Err(ManagerError::Validation(_))
        ));
        assert!(BucketKind::try_from(3u8).is_err());
        assert!(cluster.writes().is_empty());
    }

    #[test]
    fn index_is_confirmed_once_online() {
        let cluster = Arc::new(InMemoryCluster::default().with_lag(2));
        cluster.seed_bucket(&orders());
        let ctx = context(&cluster);
        let manager = IndexManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut index = resource(manager.clone(), idx_email(&["email"]));

        assert_eq!(reconciler.create(&mut index).unwrap(), Confirmation::Confirmed);
        let observed = reconciler.read("orders/idx_email").unwrap().unwrap();
        assert_eq!(observed.fields, vec!["email".to_string()]);
        assert!(!observed.is_primary);
    }

    #[test]
    fn adopted_index_must_be_online() {
        let cluster = Arc::new(InMemoryCluster::default());
        cluster.seed_bucket(&orders());
        cluster.seed_index(&idx_email(&["email"]), 10_000);
        let ctx = context(&cluster);
        let manager = IndexManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut index = resource(manager.clone(), idx_email(&["email"]));

        assert_eq!(
            reconciler.ensure_present(&mut index, None).unwrap(),
            Confirmation::NotYetVisible
        );
        assert!(!index.existence_confirmed);
        assert_eq!(index.identity, None);
        assert_eq!(index.lifecycle, LifecycleState::Unmanaged);
        assert!(cluster.writes().is_empty());
    }

    #[test]
    fn adopted_index_is_confirmed_once_it_finishes_building() {
        let cluster = Arc::new(InMemoryCluster::default());
        cluster.seed_bucket(&orders());
        cluster.seed_index(&idx_email(&["email"]), 2);
        let ctx = context(&cluster);
        let manager = IndexManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut index = resource(manager.clone(), idx_email(&["email"]));

        assert_eq!(
            reconciler.ensure_present(&mut index, None).unwrap(),
            Confirmation::Confirmed
        );
        assert!(index.existence_confirmed);
        assert_eq!(
            index.observed.as_ref().map(|observed| observed.state),
            Some(IndexState::Online)
        );
        assert!(cluster.writes().is_empty());
    }

    #[test]
    fn created_index_waits_out_the_build() {
        let cluster = Arc::new(InMemoryCluster::default().with_index_build(3));
        cluster.seed_bucket(&orders());
        let ctx = context(&cluster);
        let manager = IndexManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut index = resource(manager.clone(), idx_email(&["email"]));

        assert_eq!(reconciler.create(&mut index).unwrap(), Confirmation::Confirmed);
        assert_eq!(cluster.writes(), vec!["create_index orders/idx_email".to_string()]);
    }

    #[test]
    fn index_update_drops_then_recreates() {
        let cluster = Arc::new(InMemoryCluster::default());
        cluster.seed_bucket(&orders());
        let ctx = context(&cluster);
        let manager = IndexManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut index = resource(manager.clone(), idx_email(&["email"]));
        reconciler.create(&mut index).unwrap();

        index.desired = idx_email(&["email", "created_at"]);
        assert_eq!(reconciler.update(&mut index).unwrap(), Confirmation::Confirmed);
        let observed = reconciler.read("orders/idx_email").unwrap().unwrap();
        assert_eq!(
            observed.fields,
            vec!["email".to_string(), "created_at".to_string()]
        );
        assert_eq!(
            cluster.writes(),
            vec![
                "create_index orders/idx_email".to_string(),
                "drop_index orders/idx_email".to_string(),
                "create_index orders/idx_email".to_string(),
            ]
        );
    }

    #[test]
    fn failed_recreate_is_a_partial_update() {
        let cluster = Arc::new(InMemoryCluster::default());
        cluster.seed_bucket(&orders());
        let ctx = context(&cluster);
        let manager = IndexManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut index = resource(manager.clone(), idx_email(&["email"]));
        reconciler.create(&mut index).unwrap();

        cluster.fail_next("create_index");
        index.desired = idx_email(&["email", "created_at"]);
        let err = reconciler.update(&mut index).unwrap_err();
        assert!(matches!(err, ManagerError::PartialUpdate { ref identity, .. } if identity == "orders/idx_email"));
        assert_eq!(index.identity, None);
        assert_eq!(index.lifecycle, LifecycleState::Failed);
        assert!(reconciler.read("orders/idx_email").unwrap().is_none());
    }

    #[test]
    fn update_keeps_identity_for_upsert_kinds() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut bucket = resource(manager.clone(), orders());
        reconciler.create(&mut bucket).unwrap();

        bucket.desired.quota = 256;
        bucket.desired.flush_enabled = true;
        assert_eq!(reconciler.update(&mut bucket).unwrap(), Confirmation::Confirmed);
        assert_eq!(bucket.identity.as_deref(), Some("orders"));
        let observed = bucket.observed.as_ref().unwrap();
        assert_eq!(observed.quota, 256);
        assert!(observed.flush_enabled);

        bucket.desired.name = "archive".to_string();
        assert!(matches!(
            reconciler.update(&mut bucket),
            Err(ManagerError::Validation(_))
        ));
    }

    #[test]
    fn identity_change_replaces_the_object() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = BucketManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut bucket = resource(manager.clone(), orders());
        reconciler.create(&mut bucket).unwrap();

        bucket.desired.name = "archive".to_string();
        reconciler.ensure_present(&mut bucket, None).unwrap();
        assert_eq!(bucket.identity.as_deref(), Some("archive"));
        assert!(reconciler.read("orders").unwrap().is_none());
        assert!(reconciler.read("archive").unwrap().is_some());
    }

    #[test]
    fn deleting_a_missing_user_succeeds_twice() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = UserManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut ghost = resource(
            manager.clone(),
            UserSettings {
                name: "ghost".to_string(),
                password: "secret".to_string(),
                roles: vec![UserRole::global("ro_admin")],
            },
        );
        reconciler.delete(&mut ghost).unwrap();
        reconciler.delete(&mut ghost).unwrap();
        assert_eq!(ghost.identity, None);
        assert_eq!(ghost.lifecycle, LifecycleState::Unmanaged);
    }

    #[test]
    fn connection_errors_propagate_untouched() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = UserManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let mut user = resource(
            manager.clone(),
            UserSettings {
                name: "reporter".to_string(),
                password: "secret".to_string(),
                roles: vec!["bucket_admin:orders".parse().unwrap()],
            },
        );
        cluster.fail_next_with_connection("upsert_user");
        assert!(matches!(
            reconciler.create(&mut user),
            Err(ManagerError::Connection(_))
        ));
        assert_eq!(user.lifecycle, LifecycleState::Failed);
        assert_eq!(user.identity, None);
    }

    #[test]
    fn password_change_is_detected_against_last_applied() {
        let cluster = Arc::new(InMemoryCluster::default());
        let ctx = context(&cluster);
        let manager = UserManager::arc();
        let reconciler = Reconciler::new(manager.as_ref(), &ctx);
        let first = UserSettings {
            name: "reporter".to_string(),
            password: "secret".to_string(),
            roles: vec![UserRole::global("ro_admin")],
        };
        let mut user = resource(manager.clone(), first.clone());
        reconciler.create(&mut user).unwrap();

        user.desired.password = "rotated".to_string();
        reconciler.ensure_present(&mut user, Some(&first)).unwrap();
        assert_eq!(
            cluster.writes(),
            vec![
                "upsert_user reporter".to_string(),
                "upsert_user reporter".to_string()
            ]
        );
    }
}
