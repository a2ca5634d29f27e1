//! Dynamic credentials: `creds/<role>` and `sts/<role>`.
//!
//! IAM users are created under a WAL entry of kind [`USER_WAL_KIND`] that is
//! only removed once the access key exists. A request that dies part way
//! leaves the entry behind, and the rollback driver tears the user down
//! through [`IamBackend::delete_user`], the same path lease revocation uses.

use std::sync::Arc;

use chrono::TimeDelta;
use itertools::Itertools;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    error::Error,
    framework::{
        field::{fields, FieldMap},
        lease::{self, LeaseInputs},
        path::handler,
        wal, FieldData, FieldSchema, FieldType, Operation, Path, Request, Response, Secret,
    },
    iam::{AssumeRoleInput, CreateUserInput, FederationTokenInput, IamError, StsCredentials},
    storage::Storage,
    utils::truncate,
};

use super::{
    config_lease::LeaseConfig,
    config_root::RootConfig,
    policy,
    roles::{get_role, CredentialType, RoleEntry},
    template::UsernameTemplate,
    IamBackend, NAME_PATTERN,
};

pub const USER_WAL_KIND: &str = "user";
pub const ACCESS_KEYS_SECRET: &str = "access_keys";
pub const STS_SECRET: &str = "sts";

pub const DEFAULT_STS_TTL: i64 = 3600;

const MAX_SESSION_NAME_LEN: usize = 64;
const MAX_FEDERATION_NAME_LEN: usize = 32;

/// Payload of a [`USER_WAL_KIND`] entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWal {
    pub username: String,
}

fn creds_fields() -> Arc<FieldMap> {
    fields([
        ("name", FieldSchema::new(FieldType::NameString, "Name of the role")),
        ("ttl", FieldSchema::new(FieldType::DurationSeconds, "Lifetime of the returned STS credentials.")),
        ("role_arn", FieldSchema::new(FieldType::String, "ARN of role to assume when credential_type is assumed_role")),
        ("role_session_name", FieldSchema::new(FieldType::String, "Session name to use when assuming role.")),
    ])
}

pub(super) fn paths(this: &Arc<IamBackend>) -> Vec<Path> {
    let creds = Path::new(format!("creds/{NAME_PATTERN}"))
        .fields(creds_fields())
        .operation(Operation::Read, handler(this, IamBackend::path_creds_read))
        .operation(Operation::Update, handler(this, IamBackend::path_creds_read))
        .help(
            "Generate AWS credentials from a specific Vault role.",
            "Creates an IAM user with the role's policies and returns an access key\nfor it, or STS credentials when the role only allows those. The user\nis deleted when the lease is revoked.",
        );

    let sts = Path::new(format!("sts/{NAME_PATTERN}"))
        .fields(creds_fields())
        .operation(Operation::Read, handler(this, IamBackend::path_creds_read))
        .operation(Operation::Update, handler(this, IamBackend::path_creds_read))
        .help(
            "Generate AWS STS credentials from a specific Vault role.",
            "Returns temporary credentials from AssumeRole or GetFederationToken.\nThe lease is not renewable; the credentials expire on their own.",
        );

    vec![creds, sts]
}

pub(super) fn access_keys_secret(this: &Arc<IamBackend>) -> Secret {
    Secret {
        fields: fields([
            ("access_key", FieldSchema::new(FieldType::String, "Access Key")),
            ("secret_key", FieldSchema::new(FieldType::String, "Secret Key")),
        ]),
        renew: Some(handler(this, IamBackend::secret_access_keys_renew)),
        revoke: Some(handler(this, IamBackend::secret_access_keys_revoke)),
        ..Secret::new(ACCESS_KEYS_SECRET)
    }
}

pub(super) fn sts_secret(this: &Arc<IamBackend>) -> Secret {
    Secret {
        fields: fields([
            ("access_key", FieldSchema::new(FieldType::String, "Access Key")),
            ("secret_key", FieldSchema::new(FieldType::String, "Secret Key")),
            ("session_token", FieldSchema::new(FieldType::String, "Session Token")),
        ]),
        revoke: Some(handler(this, IamBackend::secret_sts_revoke)),
        ..Secret::new(STS_SECRET)
    }
}

/// Picks the credential type a request issues, or the message explaining why none applies.
fn resolve_credential_type(
    name: &str,
    role: &RoleEntry,
    via_sts: bool,
    operation: Operation,
) -> Result<CredentialType, String> {
    use CredentialType::*;

    if via_sts {
        let sts = role
            .credential_types
            .iter()
            .copied()
            .filter(CredentialType::is_sts)
            .collect::<Vec<_>>();

        return match sts.as_slice() {
            [one] => Ok(*one),
            [] if role.legacy => Err(format!(
                "attempted to retrieve {IamUser} credentials through the sts path; this is not allowed for legacy roles"
            )),
            [] => Err(format!(
                "role {name:?} does not allow STS credentials, its credential types are {}",
                role.credential_types.iter().join(",")
            )),
            _ => Err(format!(
                "role {name:?} allows both {AssumedRole} and {FederationToken}, which is ambiguous on the sts path"
            )),
        };
    }

    match role.credential_types.as_slice() {
        [one] => Ok(*one),
        // Only reachable through the legacy upgrade.
        [IamUser, FederationToken] => Ok(if operation == Operation::Update {
            FederationToken
        } else {
            IamUser
        }),
        _ => Err(format!(
            "role {name:?} has credential types {} and cannot be read from creds/",
            role.credential_types.iter().join(",")
        )),
    }
}

/// `requested` when positive, else the role default, else an hour, capped at the role max.
fn sts_ttl(role: &RoleEntry, requested: i64) -> i64 {
    let ttl = [requested, role.default_sts_ttl]
        .into_iter()
        .find(|t| *t > 0)
        .unwrap_or(DEFAULT_STS_TTL);

    if role.max_sts_ttl > 0 {
        ttl.min(role.max_sts_ttl)
    } else {
        ttl
    }
}

/// Treats "no such entity" as absence.
fn found<T>(result: Result<T, IamError>) -> Result<Option<T>, IamError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn sts_data(creds: &StsCredentials, ttl: i64) -> Map<String, Value> {
    let session_token = creds.session_token.expose_secret();

    let mut data = Map::new();
    data.insert("access_key".to_owned(), json!(creds.access_key_id));
    data.insert("secret_key".to_owned(), json!(creds.secret_access_key.expose_secret()));
    data.insert("session_token".to_owned(), json!(session_token));
    data.insert("security_token".to_owned(), json!(session_token));
    data.insert("ttl".to_owned(), json!(ttl));
    if let Some(expiration) = creds.expiration {
        data.insert("expiration".to_owned(), json!(expiration.to_rfc3339()));
    }
    data
}

impl IamBackend {
    async fn username_template(&self, storage: &dyn Storage) -> Result<UsernameTemplate, Error> {
        match RootConfig::load(storage).await? {
            Some(config) => config.username_template(),
            None => Ok(UsernameTemplate::default()),
        }
    }

    async fn path_creds_read(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let name = data.get_string("name")?;

        let Some(role) = get_role(&*req.storage, &name).await? else {
            return Ok(Some(Response::error(format!("Role '{name}' not found"))));
        };

        let via_sts = req.path.starts_with("sts/");
        let credential_type = match resolve_credential_type(&name, &role, via_sts, req.operation) {
            Ok(ty) => ty,
            Err(message) => return Ok(Some(Response::error(message))),
        };

        match credential_type {
            CredentialType::IamUser => self.issue_user(&req, &name, &role).await,
            CredentialType::AssumedRole => self.issue_assumed_role(&req, &data, &name, &role).await,
            CredentialType::FederationToken => {
                self.issue_federation_token(&req, &data, &name, &role).await
            }
        }
    }

    async fn issue_user(
        &self,
        req: &Request,
        name: &str,
        role: &RoleEntry,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;
        let now = self.clock().now();

        let username = self
            .username_template(storage)
            .await?
            .render(&req.display_name, name, now);

        // Lease errors must surface before any cloud call.
        let lease_config = LeaseConfig::load(storage).await?;
        let ttl = lease::calculate_ttl(
            LeaseInputs::builder()
                .backend_increment(lease_config.ttl())
                .backend_max(lease_config.max_ttl())
                .mount_default(self.system().default_lease_ttl())
                .mount_max(self.system().max_lease_ttl())
                .issue_time(now)
                .now(now)
                .build(),
        )?;

        let wal_id = wal::put(
            storage,
            USER_WAL_KIND,
            &UserWal {
                username: username.clone(),
            },
            now,
        )
        .await?;

        let iam = self.iam_client(storage).await?;

        iam.create_user(CreateUserInput {
            user_name: username.clone(),
            path: Some(role.user_path.clone()).filter(|p| !p.is_empty()),
            permissions_boundary: Some(role.permissions_boundary_arn.clone()).filter(|p| !p.is_empty()),
            tags: role.iam_tags.clone(),
        })
        .await
        .map_err(|e| Error::cloud("Error creating IAM user", e))?;

        if !role.policy_document.is_empty() {
            iam.put_user_policy(&username, name, &role.policy_document)
                .await
                .map_err(|e| Error::cloud("Error adding user policy", e))?;
        }

        for arn in &role.policy_arns {
            iam.attach_user_policy(&username, arn)
                .await
                .map_err(|e| Error::cloud("Error attaching user policy", e))?;
        }

        for group in &role.iam_groups {
            iam.add_user_to_group(&username, group)
                .await
                .map_err(|e| Error::cloud("Error adding user to group", e))?;
        }

        let key = iam
            .create_access_key(Some(&username))
            .await
            .map_err(|e| Error::cloud("Error creating access keys", e))?;

        if let Err(e) = wal::delete(storage, &wal_id).await {
            tracing::warn!(wal_id = %wal_id, username = %username, error = %e, "failed to delete WAL entry for issued user");
        }

        let mut data = Map::new();
        data.insert("access_key".to_owned(), json!(key.access_key_id));
        data.insert("secret_key".to_owned(), json!(key.secret_access_key.expose_secret()));
        data.insert("session_token".to_owned(), Value::Null);
        data.insert("security_token".to_owned(), Value::Null);

        let mut internal = Map::new();
        internal.insert("username".to_owned(), json!(username));
        internal.insert("role".to_owned(), json!(name));

        let mut resp = Secret::new(ACCESS_KEYS_SECRET).response(data, internal, now);
        if let Some(secret) = resp.secret.as_mut() {
            secret.ttl = ttl;
            secret.renewable = true;
            if lease_config.max_ttl > 0 {
                secret.max_ttl = lease_config.max_ttl();
            }
        }

        tracing::info!(role = %name, username = %username, "issued IAM user credentials");

        Ok(Some(resp))
    }

    /// The inline policy and managed ARNs passed to STS: the role's own plus
    /// those of its groups.
    async fn sts_policies(
        &self,
        storage: &dyn Storage,
        role: &RoleEntry,
    ) -> Result<(Option<String>, Vec<String>), Error> {
        let mut documents = vec![role.policy_document.clone()];
        let mut arns = role.policy_arns.clone();

        if !role.iam_groups.is_empty() {
            let iam = self.iam_client(storage).await?;

            for group in &role.iam_groups {
                let names = iam
                    .list_group_policies(group)
                    .await
                    .map_err(|e| Error::cloud(format!("Error listing inline policies of group {group}"), e))?;

                for policy_name in names {
                    documents.push(
                        iam.get_group_policy(group, &policy_name)
                            .await
                            .map_err(|e| Error::cloud(format!("Error reading policy {policy_name} of group {group}"), e))?,
                    );
                }

                arns.extend(
                    iam.list_attached_group_policies(group)
                        .await
                        .map_err(|e| Error::cloud(format!("Error listing managed policies of group {group}"), e))?,
                );
            }
        }

        let combined = policy::combine(&documents)?;
        let arns = arns.into_iter().unique().collect();

        Ok((Some(combined).filter(|p| !p.is_empty()), arns))
    }

    async fn issue_assumed_role(
        &self,
        req: &Request,
        data: &FieldData,
        name: &str,
        role: &RoleEntry,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;
        let now = self.clock().now();

        let requested = data.get_string("role_arn")?;
        let role_arn = match (requested.is_empty(), role.role_arns.as_slice()) {
            (true, [only]) => only.clone(),
            (true, []) => {
                return Ok(Some(Response::error(format!(
                    "role {name:?} has no role_arns configured"
                ))))
            }
            (true, _) => {
                return Ok(Some(Response::error(
                    "role_arn must be supplied when the role has more than one role_arns",
                )))
            }
            (false, arns) if arns.contains(&requested) => requested,
            (false, _) => {
                return Ok(Some(Response::error(format!(
                    "role_arn {requested:?} is not allowed by role {name:?}"
                ))))
            }
        };

        let mut session_name = data.get_string("role_session_name")?;
        if session_name.is_empty() {
            session_name = self
                .username_template(storage)
                .await?
                .render(&req.display_name, name, now);
        }
        let session_name = truncate(&session_name, MAX_SESSION_NAME_LEN).to_owned();

        let ttl = sts_ttl(role, data.get_duration("ttl")?);
        let (policy, policy_arns) = self.sts_policies(storage, role).await?;

        let creds = self
            .sts_client(storage)
            .await?
            .assume_role(AssumeRoleInput {
                role_arn: role_arn.clone(),
                role_session_name: session_name,
                policy,
                policy_arns,
                duration_seconds: ttl,
            })
            .await
            .map_err(|e| Error::cloud("Error assuming role", e))?;

        let mut data = sts_data(&creds, ttl);
        data.insert("arn".to_owned(), json!(role_arn));

        let mut internal = Map::new();
        internal.insert("role".to_owned(), json!(name));
        internal.insert("role_arn".to_owned(), json!(role_arn));

        Ok(Some(sts_response(data, internal, now, ttl)))
    }

    async fn issue_federation_token(
        &self,
        req: &Request,
        data: &FieldData,
        name: &str,
        role: &RoleEntry,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;
        let now = self.clock().now();

        let token_name = self
            .username_template(storage)
            .await?
            .render(&req.display_name, name, now);
        let token_name = truncate(&token_name, MAX_FEDERATION_NAME_LEN).to_owned();

        let ttl = sts_ttl(role, data.get_duration("ttl")?);
        let (policy, policy_arns) = self.sts_policies(storage, role).await?;

        let creds = self
            .sts_client(storage)
            .await?
            .get_federation_token(FederationTokenInput {
                name: token_name,
                policy,
                policy_arns,
                duration_seconds: ttl,
            })
            .await
            .map_err(|e| Error::cloud("Error generating STS keys", e))?;

        let mut internal = Map::new();
        internal.insert("role".to_owned(), json!(name));

        Ok(Some(sts_response(sts_data(&creds, ttl), internal, now, ttl)))
    }

    async fn secret_access_keys_renew(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let lease_config = LeaseConfig::load(&*req.storage).await?;

        lease::extend(
            &req,
            lease_config.ttl(),
            lease_config.max_ttl(),
            &**self.system(),
            self.clock().now(),
        )
    }

    async fn secret_access_keys_revoke(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let username = req
            .secret
            .as_ref()
            .and_then(|s| s.internal_str("username"))
            .ok_or_else(|| Error::validation("secret is missing username internal data"))?
            .to_owned();

        self.delete_user(&*req.storage, &username).await?;

        Ok(None)
    }

    /// STS credentials expire on their own.
    async fn secret_sts_revoke(
        self: Arc<Self>,
        _req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        Ok(None)
    }

    pub(super) async fn user_rollback(&self, req: Request, data: Value) -> Result<(), Error> {
        let entry: UserWal = serde_json::from_value(data)?;
        self.delete_user(&*req.storage, &entry.username).await
    }

    /// Removes an IAM user and everything attached to it.
    ///
    /// Safe to repeat: anything already gone is skipped, and a user that
    /// never existed is a no-op.
    pub async fn delete_user(&self, storage: &dyn Storage, username: &str) -> Result<(), Error> {
        let iam = self.iam_client(storage).await?;

        let Some(groups) = found(iam.list_groups_for_user(username).await)
            .map_err(|e| Error::cloud("Error listing user groups", e))?
        else {
            tracing::debug!(%username, "IAM user does not exist, nothing to remove");
            return Ok(());
        };
        for group in groups {
            found(iam.remove_user_from_group(username, &group).await)
                .map_err(|e| Error::cloud("Error removing user from group", e))?;
        }

        let policies = found(iam.list_user_policies(username).await)
            .map_err(|e| Error::cloud("Error listing user policies", e))?;
        for policy_name in policies.into_iter().flatten() {
            found(iam.delete_user_policy(username, &policy_name).await)
                .map_err(|e| Error::cloud("Error deleting user policy", e))?;
        }

        let attached = found(iam.list_attached_user_policies(username).await)
            .map_err(|e| Error::cloud("Error listing attached user policies", e))?;
        for arn in attached.into_iter().flatten() {
            found(iam.detach_user_policy(username, &arn).await)
                .map_err(|e| Error::cloud("Error detaching user policy", e))?;
        }

        let keys = found(iam.list_access_keys(Some(username)).await)
            .map_err(|e| Error::cloud("Error listing access keys", e))?;
        for key in keys.into_iter().flatten() {
            found(iam.delete_access_key(&key.access_key_id, Some(username)).await)
                .map_err(|e| Error::cloud("Error deleting access key", e))?;
        }

        found(iam.delete_user(username).await)
            .map_err(|e| Error::cloud("Error deleting IAM user", e))?;

        tracing::info!(%username, "removed IAM user");

        Ok(())
    }
}

fn sts_response(
    data: Map<String, Value>,
    internal: Map<String, Value>,
    now: chrono::DateTime<chrono::Utc>,
    ttl: i64,
) -> Response {
    let mut resp = Secret::new(STS_SECRET).response(data, internal, now);
    if let Some(secret) = resp.secret.as_mut() {
        secret.ttl = TimeDelta::seconds(ttl);
        secret.renewable = false;
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(types: &[CredentialType]) -> RoleEntry {
        RoleEntry {
            credential_types: types.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_single_type() {
        let r = role(&[CredentialType::AssumedRole]);
        assert_eq!(
            resolve_credential_type("r", &r, false, Operation::Read),
            Ok(CredentialType::AssumedRole)
        );
        assert_eq!(
            resolve_credential_type("r", &r, true, Operation::Read),
            Ok(CredentialType::AssumedRole)
        );
    }

    #[test]
    fn test_resolve_legacy_pair() {
        let r = RoleEntry::from_legacy(r#"{"Version":"2012-10-17"}"#).unwrap();

        assert_eq!(
            resolve_credential_type("r", &r, false, Operation::Read),
            Ok(CredentialType::IamUser)
        );
        assert_eq!(
            resolve_credential_type("r", &r, false, Operation::Update),
            Ok(CredentialType::FederationToken)
        );
        assert_eq!(
            resolve_credential_type("r", &r, true, Operation::Read),
            Ok(CredentialType::FederationToken)
        );
    }

    #[test]
    fn test_resolve_sts_path_without_sts_type() {
        let legacy = RoleEntry::from_legacy("arn:aws:iam::aws:policy/ReadOnlyAccess").unwrap();
        assert_eq!(
            resolve_credential_type("r", &legacy, true, Operation::Read).unwrap_err(),
            "attempted to retrieve iam_user credentials through the sts path; this is not allowed for legacy roles"
        );

        let current = role(&[CredentialType::IamUser]);
        assert!(resolve_credential_type("r", &current, true, Operation::Read)
            .unwrap_err()
            .contains("does not allow STS credentials"));
    }

    #[test]
    fn test_sts_ttl() {
        let mut r = role(&[CredentialType::FederationToken]);
        assert_eq!(sts_ttl(&r, 0), DEFAULT_STS_TTL);
        assert_eq!(sts_ttl(&r, 900), 900);

        r.default_sts_ttl = 1800;
        assert_eq!(sts_ttl(&r, 0), 1800);

        r.max_sts_ttl = 1200;
        assert_eq!(sts_ttl(&r, 0), 1200);
        assert_eq!(sts_ttl(&r, 7200), 1200);
    }

    #[test]
    fn test_found() {
        assert_eq!(found::<()>(Err(IamError::not_found("gone"))).unwrap(), None);
        assert_eq!(found(Ok(1)).unwrap(), Some(1));
        assert!(found::<()>(Err(IamError::api("Throttling", ""))).is_err());
    }
}
