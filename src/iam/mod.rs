//! Narrow facade over the cloud IAM and STS APIs.
//!
//! Nothing above this module sees SDK types. [`aws`] talks to AWS proper and
//! [`memory`] is a stateful emulator used by tests and local development.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use secrecy::SecretString;
use snafu::Snafu;

pub mod aws;
pub mod memory;

pub const NO_SUCH_ENTITY: &str = "NoSuchEntity";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IamError {
    /// An error response from the service, with its error code.
    #[snafu(display("{code}: {message}"))]
    Api { code: String, message: String },

    /// The request never produced a service response.
    #[snafu(display("{message}"))]
    Transport { message: String },
}

impl IamError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::api(NO_SUCH_ENTITY, message)
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            Self::Transport { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(NO_SUCH_ENTITY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamUser {
    pub user_name: String,
    pub arn: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateUserInput {
    pub user_name: String,
    pub path: Option<String>,
    pub permissions_boundary: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// A freshly created access key. The secret is only ever available here.
#[derive(Debug, Clone)]
pub struct AccessKey {
    pub user_name: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyMetadata {
    pub user_name: String,
    pub access_key_id: String,
    pub create_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct AssumeRoleInput {
    pub role_arn: String,
    pub role_session_name: String,
    pub policy: Option<String>,
    pub policy_arns: Vec<String>,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FederationTokenInput {
    pub name: String,
    pub policy: Option<String>,
    pub policy_arns: Vec<String>,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct StsCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: SecretString,
    pub expiration: Option<DateTime<Utc>>,
}

pub type IamResult<'a, T> = BoxFuture<'a, Result<T, IamError>>;

/// The IAM calls the backend makes.
///
/// Methods that take an optional user name act on the calling identity when
/// it is `None`.
pub trait IamClient: Send + Sync + 'static {
    fn create_user(&self, input: CreateUserInput) -> IamResult<'_, IamUser>;

    fn get_user<'a>(&'a self, user_name: Option<&'a str>) -> IamResult<'a, IamUser>;

    fn delete_user<'a>(&'a self, user_name: &'a str) -> IamResult<'a, ()>;

    fn put_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_name: &'a str,
        policy_document: &'a str,
    ) -> IamResult<'a, ()>;

    fn delete_user_policy<'a>(&'a self, user_name: &'a str, policy_name: &'a str)
        -> IamResult<'a, ()>;

    fn list_user_policies<'a>(&'a self, user_name: &'a str) -> IamResult<'a, Vec<String>>;

    fn attach_user_policy<'a>(&'a self, user_name: &'a str, policy_arn: &'a str)
        -> IamResult<'a, ()>;

    fn detach_user_policy<'a>(&'a self, user_name: &'a str, policy_arn: &'a str)
        -> IamResult<'a, ()>;

    fn list_attached_user_policies<'a>(&'a self, user_name: &'a str)
        -> IamResult<'a, Vec<String>>;

    fn add_user_to_group<'a>(&'a self, user_name: &'a str, group_name: &'a str)
        -> IamResult<'a, ()>;

    fn remove_user_from_group<'a>(
        &'a self,
        user_name: &'a str,
        group_name: &'a str,
    ) -> IamResult<'a, ()>;

    fn list_groups_for_user<'a>(&'a self, user_name: &'a str) -> IamResult<'a, Vec<String>>;

    fn create_access_key<'a>(&'a self, user_name: Option<&'a str>) -> IamResult<'a, AccessKey>;

    fn delete_access_key<'a>(
        &'a self,
        access_key_id: &'a str,
        user_name: Option<&'a str>,
    ) -> IamResult<'a, ()>;

    fn list_access_keys<'a>(
        &'a self,
        user_name: Option<&'a str>,
    ) -> IamResult<'a, Vec<AccessKeyMetadata>>;

    /// ARNs of the managed policies attached to a group.
    fn list_attached_group_policies<'a>(&'a self, group_name: &'a str)
        -> IamResult<'a, Vec<String>>;

    /// Names of a group's inline policies.
    fn list_group_policies<'a>(&'a self, group_name: &'a str) -> IamResult<'a, Vec<String>>;

    /// The decoded policy document of a group inline policy.
    fn get_group_policy<'a>(&'a self, group_name: &'a str, policy_name: &'a str)
        -> IamResult<'a, String>;
}

pub trait StsClient: Send + Sync + 'static {
    fn assume_role(&self, input: AssumeRoleInput) -> IamResult<'_, StsCredentials>;

    fn get_federation_token(&self, input: FederationTokenInput) -> IamResult<'_, StsCredentials>;
}
