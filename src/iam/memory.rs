//! Stateful in-memory IAM and STS emulator.
//!
//! Tracks users, groups, policies and access keys closely enough that the
//! backend's cleanup and rotation logic can be exercised without AWS. Calls
//! are recorded by API name, and any call can be made to fail with a chosen
//! error code.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::utils::random_alphanumeric;

use super::{
    AccessKey, AccessKeyMetadata, AssumeRoleInput, CreateUserInput, FederationTokenInput,
    IamClient, IamError, IamResult, IamUser, StsClient, StsCredentials,
};

pub const MAX_KEYS_PER_USER: usize = 2;

#[derive(Debug, Default, Clone)]
struct User {
    path: Option<String>,
    permissions_boundary: Option<String>,
    tags: BTreeMap<String, String>,
    inline_policies: BTreeMap<String, String>,
    attached_policies: BTreeSet<String>,
    groups: BTreeSet<String>,
    keys: Vec<(AccessKeyMetadata, SecretString)>,
}

#[derive(Debug, Default, Clone)]
struct Group {
    inline_policies: BTreeMap<String, String>,
    attached_policies: Vec<String>,
}

#[derive(Debug)]
struct State {
    account: String,
    caller: Option<String>,
    users: BTreeMap<String, User>,
    groups: BTreeMap<String, Group>,
    calls: Vec<String>,
    failures: HashMap<String, (String, String)>,
    queued_keys: VecDeque<(String, String)>,
    key_length: usize,
    next_create_date: DateTime<Utc>,
    assume_role_inputs: Vec<AssumeRoleInput>,
    federation_token_inputs: Vec<FederationTokenInput>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            account: "123456789012".to_owned(),
            caller: None,
            users: BTreeMap::new(),
            groups: BTreeMap::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            queued_keys: VecDeque::new(),
            key_length: 20,
            next_create_date: DateTime::from_timestamp(1_577_836_800, 0).unwrap_or_default(),
            assume_role_inputs: Vec::new(),
            federation_token_inputs: Vec::new(),
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryIamClient {
    state: Arc<Mutex<State>>,
}

impl InMemoryIamClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `call`, then fails it if a failure was injected for it.
    fn begin(&self, call: &str) -> Result<MutexGuard<'_, State>, IamError> {
        let mut state = self.state();
        state.calls.push(call.to_owned());
        if let Some((code, message)) = state.failures.get(call) {
            return Err(IamError::api(code.clone(), message.clone()));
        }
        Ok(state)
    }

    /// Makes every subsequent `call` fail with `code` until cleared.
    pub fn fail(&self, call: &str, code: &str, message: &str) {
        self.state()
            .failures
            .insert(call.to_owned(), (code.to_owned(), message.to_owned()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Sets the identity used by calls made without a user name, creating the user.
    pub fn set_caller(&self, user_name: &str) {
        let mut state = self.state();
        state.users.entry(user_name.to_owned()).or_default();
        state.caller = Some(user_name.to_owned());
    }

    pub fn add_user(&self, user_name: &str) {
        self.state().users.entry(user_name.to_owned()).or_default();
    }

    pub fn add_group(&self, group_name: &str, inline: &[(&str, &str)], attached: &[&str]) {
        self.state().groups.insert(
            group_name.to_owned(),
            Group {
                inline_policies: inline
                    .iter()
                    .map(|(n, d)| ((*n).to_owned(), (*d).to_owned()))
                    .collect(),
                attached_policies: attached.iter().map(|a| (*a).to_owned()).collect(),
            },
        );
    }

    /// Length of generated key ids and secrets.
    pub fn set_key_length(&self, len: usize) {
        self.state().key_length = len;
    }

    /// The next access key created will carry exactly these values.
    pub fn queue_access_key(&self, access_key_id: &str, secret_access_key: &str) {
        self.state()
            .queued_keys
            .push_back((access_key_id.to_owned(), secret_access_key.to_owned()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn user_exists(&self, user_name: &str) -> bool {
        self.state().users.contains_key(user_name)
    }

    pub fn user_names(&self) -> Vec<String> {
        self.state().users.keys().cloned().collect()
    }

    pub fn access_key_ids(&self, user_name: &str) -> Vec<String> {
        self.state()
            .users
            .get(user_name)
            .map(|u| u.keys.iter().map(|(m, _)| m.access_key_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn user_inline_policies(&self, user_name: &str) -> BTreeMap<String, String> {
        self.state()
            .users
            .get(user_name)
            .map(|u| u.inline_policies.clone())
            .unwrap_or_default()
    }

    pub fn user_groups(&self, user_name: &str) -> Vec<String> {
        self.state()
            .users
            .get(user_name)
            .map(|u| u.groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_path(&self, user_name: &str) -> Option<String> {
        self.state().users.get(user_name).and_then(|u| u.path.clone())
    }

    pub fn user_tags(&self, user_name: &str) -> BTreeMap<String, String> {
        self.state()
            .users
            .get(user_name)
            .map(|u| u.tags.clone())
            .unwrap_or_default()
    }

    pub fn user_permissions_boundary(&self, user_name: &str) -> Option<String> {
        self.state()
            .users
            .get(user_name)
            .and_then(|u| u.permissions_boundary.clone())
    }

    /// Whether the secret of `access_key_id` is `secret`.
    pub fn key_secret_matches(&self, access_key_id: &str, secret: &str) -> bool {
        self.state().users.values().any(|u| {
            u.keys
                .iter()
                .any(|(m, s)| m.access_key_id == access_key_id && s.expose_secret() == secret)
        })
    }

    pub fn assume_role_inputs(&self) -> Vec<AssumeRoleInput> {
        self.state().assume_role_inputs.clone()
    }

    pub fn federation_token_inputs(&self) -> Vec<FederationTokenInput> {
        self.state().federation_token_inputs.clone()
    }
}

impl State {
    fn arn(&self, user_name: &str) -> String {
        format!("arn:aws:iam::{}:user/{user_name}", self.account)
    }

    fn resolve(&self, user_name: Option<&str>) -> Result<String, IamError> {
        match user_name.map(str::to_owned).or_else(|| self.caller.clone()) {
            Some(name) => Ok(name),
            None => Err(IamError::api(
                "ValidationError",
                "no caller identity is configured",
            )),
        }
    }

    fn user(&mut self, user_name: &str) -> Result<&mut User, IamError> {
        self.users
            .get_mut(user_name)
            .ok_or_else(|| IamError::not_found(format!("The user with name {user_name} cannot be found.")))
    }

    fn new_key(&mut self, user_name: &str) -> (AccessKeyMetadata, SecretString) {
        let (id, secret) = self.queued_keys.pop_front().unwrap_or_else(|| {
            (
                random_alphanumeric(self.key_length).to_uppercase(),
                random_alphanumeric(self.key_length),
            )
        });

        let create_date = self.next_create_date;
        self.next_create_date += TimeDelta::seconds(1);

        (
            AccessKeyMetadata {
                user_name: user_name.to_owned(),
                access_key_id: id,
                create_date: Some(create_date),
            },
            SecretString::from(secret),
        )
    }

    fn sts_credentials(&mut self) -> StsCredentials {
        let len = self.key_length;
        StsCredentials {
            access_key_id: format!("ASIA{}", random_alphanumeric(len).to_uppercase()),
            secret_access_key: SecretString::from(random_alphanumeric(len)),
            session_token: SecretString::from(random_alphanumeric(len * 2)),
            expiration: None,
        }
    }
}

impl IamClient for InMemoryIamClient {
    fn create_user(&self, input: CreateUserInput) -> IamResult<'_, IamUser> {
        Box::pin(async move {
            let mut state = self.begin("CreateUser")?;
            if state.users.contains_key(&input.user_name) {
                return Err(IamError::api(
                    "EntityAlreadyExists",
                    format!("User with name {} already exists.", input.user_name),
                ));
            }

            state.users.insert(
                input.user_name.clone(),
                User {
                    path: input.path,
                    permissions_boundary: input.permissions_boundary,
                    tags: input.tags,
                    ..Default::default()
                },
            );

            Ok(IamUser {
                arn: state.arn(&input.user_name),
                user_name: input.user_name,
            })
        })
    }

    fn get_user<'a>(&'a self, user_name: Option<&'a str>) -> IamResult<'a, IamUser> {
        Box::pin(async move {
            let mut state = self.begin("GetUser")?;
            let name = state.resolve(user_name)?;
            state.user(&name)?;
            Ok(IamUser {
                arn: state.arn(&name),
                user_name: name,
            })
        })
    }

    fn delete_user<'a>(&'a self, user_name: &'a str) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("DeleteUser")?;
            let user = state.user(user_name)?;
            if !user.keys.is_empty()
                || !user.inline_policies.is_empty()
                || !user.attached_policies.is_empty()
                || !user.groups.is_empty()
            {
                return Err(IamError::api(
                    "DeleteConflict",
                    "Cannot delete entity, must remove referenced objects first.",
                ));
            }
            state.users.remove(user_name);
            Ok(())
        })
    }

    fn put_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_name: &'a str,
        policy_document: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("PutUserPolicy")?;
            state
                .user(user_name)?
                .inline_policies
                .insert(policy_name.to_owned(), policy_document.to_owned());
            Ok(())
        })
    }

    fn delete_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_name: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("DeleteUserPolicy")?;
            match state.user(user_name)?.inline_policies.remove(policy_name) {
                Some(_) => Ok(()),
                None => Err(IamError::not_found(format!(
                    "The user policy with name {policy_name} cannot be found."
                ))),
            }
        })
    }

    fn list_user_policies<'a>(&'a self, user_name: &'a str) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut state = self.begin("ListUserPolicies")?;
            Ok(state.user(user_name)?.inline_policies.keys().cloned().collect())
        })
    }

    fn attach_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_arn: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("AttachUserPolicy")?;
            state
                .user(user_name)?
                .attached_policies
                .insert(policy_arn.to_owned());
            Ok(())
        })
    }

    fn detach_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_arn: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("DetachUserPolicy")?;
            if state.user(user_name)?.attached_policies.remove(policy_arn) {
                Ok(())
            } else {
                Err(IamError::not_found(format!(
                    "Policy {policy_arn} was not found."
                )))
            }
        })
    }

    fn list_attached_user_policies<'a>(
        &'a self,
        user_name: &'a str,
    ) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut state = self.begin("ListAttachedUserPolicies")?;
            Ok(state.user(user_name)?.attached_policies.iter().cloned().collect())
        })
    }

    fn add_user_to_group<'a>(
        &'a self,
        user_name: &'a str,
        group_name: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("AddUserToGroup")?;
            if !state.groups.contains_key(group_name) {
                return Err(IamError::not_found(format!(
                    "The group with name {group_name} cannot be found."
                )));
            }
            state.user(user_name)?.groups.insert(group_name.to_owned());
            Ok(())
        })
    }

    fn remove_user_from_group<'a>(
        &'a self,
        user_name: &'a str,
        group_name: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("RemoveUserFromGroup")?;
            if state.user(user_name)?.groups.remove(group_name) {
                Ok(())
            } else {
                Err(IamError::not_found(format!(
                    "The group with name {group_name} cannot be found."
                )))
            }
        })
    }

    fn list_groups_for_user<'a>(&'a self, user_name: &'a str) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut state = self.begin("ListGroupsForUser")?;
            Ok(state.user(user_name)?.groups.iter().cloned().collect())
        })
    }

    fn create_access_key<'a>(&'a self, user_name: Option<&'a str>) -> IamResult<'a, AccessKey> {
        Box::pin(async move {
            let mut state = self.begin("CreateAccessKey")?;
            let name = state.resolve(user_name)?;
            if state.user(&name)?.keys.len() >= MAX_KEYS_PER_USER {
                return Err(IamError::api(
                    "LimitExceeded",
                    format!("Cannot exceed quota for AccessKeysPerUser: {MAX_KEYS_PER_USER}"),
                ));
            }

            let (meta, secret) = state.new_key(&name);
            state.user(&name)?.keys.push((meta.clone(), secret.clone()));

            Ok(AccessKey {
                user_name: name,
                access_key_id: meta.access_key_id,
                secret_access_key: secret,
            })
        })
    }

    fn delete_access_key<'a>(
        &'a self,
        access_key_id: &'a str,
        user_name: Option<&'a str>,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin("DeleteAccessKey")?;
            let name = state.resolve(user_name)?;
            let user = state.user(&name)?;
            let before = user.keys.len();
            user.keys.retain(|(m, _)| m.access_key_id != access_key_id);
            if user.keys.len() == before {
                return Err(IamError::not_found(format!(
                    "The Access Key with id {access_key_id} cannot be found."
                )));
            }
            Ok(())
        })
    }

    fn list_access_keys<'a>(
        &'a self,
        user_name: Option<&'a str>,
    ) -> IamResult<'a, Vec<AccessKeyMetadata>> {
        Box::pin(async move {
            let mut state = self.begin("ListAccessKeys")?;
            let name = state.resolve(user_name)?;
            Ok(state
                .user(&name)?
                .keys
                .iter()
                .map(|(m, _)| m.clone())
                .collect())
        })
    }

    fn list_attached_group_policies<'a>(
        &'a self,
        group_name: &'a str,
    ) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.begin("ListAttachedGroupPolicies")?;
            state
                .groups
                .get(group_name)
                .map(|g| g.attached_policies.clone())
                .ok_or_else(|| IamError::not_found(format!("group {group_name}")))
        })
    }

    fn list_group_policies<'a>(&'a self, group_name: &'a str) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.begin("ListGroupPolicies")?;
            state
                .groups
                .get(group_name)
                .map(|g| g.inline_policies.keys().cloned().collect())
                .ok_or_else(|| IamError::not_found(format!("group {group_name}")))
        })
    }

    fn get_group_policy<'a>(
        &'a self,
        group_name: &'a str,
        policy_name: &'a str,
    ) -> IamResult<'a, String> {
        Box::pin(async move {
            let state = self.begin("GetGroupPolicy")?;
            state
                .groups
                .get(group_name)
                .and_then(|g| g.inline_policies.get(policy_name).cloned())
                .ok_or_else(|| IamError::not_found(format!("policy {policy_name}")))
        })
    }
}

impl StsClient for InMemoryIamClient {
    fn assume_role(&self, input: AssumeRoleInput) -> IamResult<'_, StsCredentials> {
        Box::pin(async move {
            let mut state = self.begin("AssumeRole")?;
            state.assume_role_inputs.push(input);
            Ok(state.sts_credentials())
        })
    }

    fn get_federation_token(&self, input: FederationTokenInput) -> IamResult<'_, StsCredentials> {
        Box::pin(async move {
            let mut state = self.begin("GetFederationToken")?;
            state.federation_token_inputs.push(input);
            Ok(state.sts_credentials())
        })
    }
}
