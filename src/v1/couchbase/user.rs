use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{CouchbaseResource, CouchbaseResourceCreator, CouchbaseType, ReconcileContext};
use crate::v1::{
    confirm::ConfirmationStrategy,
    manager::{ManagerError, ResourceManager},
};

pub type UserInput = UserSettings;
pub type UserOutput = UserInfo;
pub type User<'a> = CouchbaseResource<'a, UserInput, UserOutput>;

/// An RBAC role, either cluster-wide or scoped to one bucket.
///
/// Written as `role` or `role:bucket` in declarations, sent as `role[bucket]` to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserRole {
    pub role: String,
    pub bucket: Option<String>,
}

impl UserRole {
    pub fn global(role: impl ToString) -> Self {
        Self {
            role: role.to_string(),
            bucket: None,
        }
    }

    pub fn scoped(role: impl ToString, bucket: impl ToString) -> Self {
        Self {
            role: role.to_string(),
            bucket: Some(bucket.to_string()),
        }
    }

    pub fn to_rbac(&self) -> String {
        match &self.bucket {
            Some(bucket) => format!("{}[{}]", self.role, bucket),
            None => self.role.clone(),
        }
    }
}

fn valid_role_name(role: &str) -> bool {
    !role.is_empty() && role.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for UserRole {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            ManagerError::Validation(format!(
                "role {s:?} must be written as role or role:bucket"
            ))
        };
        let (role, bucket) = match s.trim().split_once(':') {
            Some((role, bucket)) => {
                let bucket = bucket.trim();
                if bucket.is_empty() || bucket.contains(':') {
                    return Err(malformed());
                }
                (role.trim(), Some(bucket.to_string()))
            }
            None => (s.trim(), None),
        };
        if !valid_role_name(role) {
            return Err(malformed());
        }
        Ok(Self {
            role: role.to_string(),
            bucket,
        })
    }
}

impl TryFrom<String> for UserRole {
    type Error = ManagerError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserRole> for String {
    fn from(role: UserRole) -> Self {
        role.to_string()
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}:{}", self.role, bucket),
            None => write!(f, "{}", self.role),
        }
    }
}

/// A user in the cluster's local authentication domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub name: String,
    pub password: String,
    pub roles: Vec<UserRole>,
}

/// What the cluster reports for a user. Passwords are never read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub roles: Vec<UserRole>,
}

pub struct UserManager;

impl UserManager {
    pub fn arc() -> Arc<dyn ResourceManager<UserInput, UserOutput>> {
        Arc::new(UserManager)
    }
}

impl CouchbaseResourceCreator for User<'_> {
    type Input = UserInput;
    type Output = UserOutput;
    fn r#type() -> CouchbaseType {
        CouchbaseType::User
    }
    fn manager() -> Arc<dyn ResourceManager<Self::Input, Self::Output>> {
        UserManager::arc()
    }
    fn input_hook(id: &str, input: &mut Self::Input) {
        if input.name.is_empty() {
            input.name = id.to_string();
        }
    }
}

impl ResourceManager<UserInput, UserOutput> for UserManager {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn identity(&self, desired: &UserInput) -> String {
        desired.name.clone()
    }

    fn validate(&self, desired: &UserInput) -> Result<(), ManagerError> {
        if desired.name.trim().is_empty() || desired.name.contains(['/', ':', '[', ']']) {
            return Err(ManagerError::Validation(format!(
                "user name {:?} is invalid",
                desired.name
            )));
        }
        if desired.password.is_empty() {
            return Err(ManagerError::Validation(format!(
                "user {} needs a password",
                desired.name
            )));
        }
        if desired.roles.is_empty() {
            return Err(ManagerError::Validation(format!(
                "user {} needs at least one role",
                desired.name
            )));
        }
        Ok(())
    }

    fn lookup(
        &self,
        ctx: &ReconcileContext,
        identity: &str,
    ) -> Result<Option<UserOutput>, ManagerError> {
        ctx.client
            .get_user(identity)
            .map_err(|e| e.into_manager(ManagerError::LookupFail))
    }

    fn submit_create(&self, ctx: &ReconcileContext, desired: &UserInput) -> Result<(), ManagerError> {
        ctx.client
            .upsert_user(desired)
            .map_err(|e| e.into_manager(ManagerError::CreateFail))
    }

    fn submit_update(&self, ctx: &ReconcileContext, desired: &UserInput) -> Result<(), ManagerError> {
        ctx.client
            .upsert_user(desired)
            .map_err(|e| e.into_manager(ManagerError::UpdateFail))
    }

    fn remove(&self, ctx: &ReconcileContext, identity: &str) -> Result<(), ManagerError> {
        ctx.client
            .remove_user(identity)
            .map_err(|e| e.into_manager(ManagerError::DeleteFail))
    }

    fn confirmation<'c>(&self, ctx: &'c ReconcileContext) -> &'c ConfirmationStrategy {
        &ctx.confirmations.user
    }

    fn has_drifted(&self, desired: &UserInput, observed: &UserOutput) -> bool {
        let want: BTreeSet<_> = desired.roles.iter().collect();
        let have: BTreeSet<_> = observed.roles.iter().collect();
        want != have
    }
}
