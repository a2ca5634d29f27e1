//! Role definitions for dynamic credentials.
//!
//! Roles are stored as JSON under `role/<name>`. Older deployments stored a
//! bare policy document or ARN under `policy/<name>`; those are still read,
//! and upgraded in memory, but never rewritten or removed on read.

use std::{collections::BTreeMap, str::FromStr, sync::Arc, sync::OnceLock};

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString};

use crate::{
    error::Error,
    framework::{
        field::fields,
        path::{existence, handler},
        FieldData, FieldSchema, FieldType, Operation, Path, PathOperation, Request, Response,
    },
    storage::Storage,
};

use super::{policy, IamBackend, NAME_PATTERN};

pub const ROLE_PREFIX: &str = "role/";
pub const LEGACY_ROLE_PREFIX: &str = "policy/";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    IamUser,
    AssumedRole,
    FederationToken,
}

impl CredentialType {
    pub fn is_sts(&self) -> bool {
        matches!(self, Self::AssumedRole | Self::FederationToken)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleEntry {
    #[serde(default)]
    pub credential_types: Vec<CredentialType>,
    #[serde(default)]
    pub policy_arns: Vec<String>,
    #[serde(default)]
    pub policy_document: String,
    #[serde(default)]
    pub role_arns: Vec<String>,
    #[serde(default)]
    pub iam_groups: Vec<String>,
    #[serde(default)]
    pub iam_tags: BTreeMap<String, String>,
    /// Seconds.
    #[serde(default)]
    pub default_sts_ttl: i64,
    /// Seconds.
    #[serde(default)]
    pub max_sts_ttl: i64,
    #[serde(default)]
    pub user_path: String,
    #[serde(default)]
    pub permissions_boundary_arn: String,
    /// Set on entries upgraded from `policy/<name>`.
    #[serde(skip)]
    pub legacy: bool,
}

fn user_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^/([\x21-\x7E]{0,510}/)?$").unwrap()
    })
}

/// Interprets a legacy `policy` or `arn` value.
fn apply_legacy(role: &mut RoleEntry, value: &str) -> Result<(), Error> {
    let value = value.trim();
    if value.starts_with("arn:") {
        if value.contains(":role/") {
            role.role_arns = vec![value.to_owned()];
            role.credential_types = vec![CredentialType::AssumedRole];
        } else {
            role.policy_arns = vec![value.to_owned()];
            role.credential_types = vec![CredentialType::IamUser];
        }
    } else {
        role.policy_document = policy::compact(value)?;
        role.credential_types = vec![CredentialType::IamUser, CredentialType::FederationToken];
    }
    Ok(())
}

/// Reports a malformed user-supplied value as a response error.
fn error_response(e: Error) -> Result<Option<Response>, Error> {
    match e {
        Error::Validation { message } => Ok(Some(Response::error(message))),
        e => Err(e),
    }
}

impl RoleEntry {
    /// Upgrades a value stored under `policy/<name>`.
    pub fn from_legacy(value: &str) -> Result<Self, Error> {
        let mut role = Self {
            legacy: true,
            ..Self::default()
        };
        apply_legacy(&mut role, value)?;
        Ok(role)
    }

    pub fn has_type(&self, ty: CredentialType) -> bool {
        self.credential_types.contains(&ty)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.credential_types.is_empty() {
            return Err(Error::validation("did not supply credential_type"));
        }

        if !self.role_arns.is_empty() && !self.has_type(CredentialType::AssumedRole) {
            return Err(Error::validation(format!(
                "cannot supply role_arns when credential_type isn't {}",
                CredentialType::AssumedRole
            )));
        }

        let sts = self.credential_types.iter().any(CredentialType::is_sts);
        if self.default_sts_ttl < 0 || self.max_sts_ttl < 0 {
            return Err(Error::validation("STS TTLs must not be negative"));
        }
        if !sts && (self.default_sts_ttl > 0 || self.max_sts_ttl > 0) {
            return Err(Error::validation(format!(
                "default_sts_ttl and max_sts_ttl require credential_type {} or {}",
                CredentialType::AssumedRole,
                CredentialType::FederationToken
            )));
        }
        if self.max_sts_ttl > 0 && self.default_sts_ttl > self.max_sts_ttl {
            return Err(Error::validation(
                "default_sts_ttl cannot exceed max_sts_ttl",
            ));
        }

        let iam_user = self.has_type(CredentialType::IamUser);
        if !self.user_path.is_empty() {
            if !iam_user {
                return Err(Error::validation(format!(
                    "user_path is only valid with credential_type {}",
                    CredentialType::IamUser
                )));
            }
            if !user_path_regex().is_match(&self.user_path) {
                return Err(Error::validation(format!(
                    "user_path {:?} is invalid: it must begin and end with '/' and contain only printable ASCII",
                    self.user_path
                )));
            }
        }
        if !self.permissions_boundary_arn.is_empty() {
            if !iam_user {
                return Err(Error::validation(format!(
                    "permissions_boundary_arn is only valid with credential_type {}",
                    CredentialType::IamUser
                )));
            }
            if !self.permissions_boundary_arn.starts_with("arn:") {
                return Err(Error::validation(format!(
                    "permissions_boundary_arn {:?} is not an ARN",
                    self.permissions_boundary_arn
                )));
            }
        }

        Ok(())
    }

    fn to_response(&self) -> Response {
        Response::json(json!({
            "credential_type": self.credential_types.iter().join(","),
            "policy_arns": self.policy_arns,
            "role_arns": self.role_arns,
            "policy_document": self.policy_document,
            "iam_groups": self.iam_groups,
            "iam_tags": self.iam_tags,
            "default_sts_ttl": self.default_sts_ttl,
            "max_sts_ttl": self.max_sts_ttl,
            "user_path": self.user_path,
            "permissions_boundary_arn": self.permissions_boundary_arn,
        }))
    }
}

/// Loads a role, preferring `role/<name>` over the legacy `policy/<name>`.
pub async fn get_role(storage: &dyn Storage, name: &str) -> Result<Option<RoleEntry>, Error> {
    if let Some(role) = storage.get_json(&format!("{ROLE_PREFIX}{name}")).await? {
        return Ok(Some(role));
    }

    match storage.get(&format!("{LEGACY_ROLE_PREFIX}{name}")).await? {
        Some(entry) => {
            let value = std::str::from_utf8(&entry.value).map_err(Error::internal)?;
            RoleEntry::from_legacy(value).map(Some)
        }
        None => Ok(None),
    }
}

pub(super) fn paths(this: &Arc<IamBackend>) -> Vec<Path> {
    vec![
        Path::new("roles/?$")
            .operation(Operation::List, handler(this, IamBackend::path_role_list))
            .help("List the existing roles in this backend", "Roles will be listed by the role name."),
        Path::new(format!("roles/{NAME_PATTERN}"))
            .fields(fields([
                ("name", FieldSchema::new(FieldType::NameString, "Name of the role")),
                ("credential_type", FieldSchema::new(FieldType::CommaStringSlice, "Type of credential to retrieve. Must be one of iam_user, assumed_role, or federation_token")),
                ("role_arns", FieldSchema::new(FieldType::CommaStringSlice, "ARNs of AWS roles allowed to be assumed. Only valid when credential_type is assumed_role")),
                ("policy_arns", FieldSchema::new(FieldType::CommaStringSlice, "ARNs of AWS managed policies to attach")),
                ("policy_document", FieldSchema::new(FieldType::String, "JSON-encoded IAM policy document")),
                ("iam_groups", FieldSchema::new(FieldType::CommaStringSlice, "Names of IAM groups that generated IAM users will be added to")),
                ("iam_tags", FieldSchema::new(FieldType::KvPairs, "IAM tags to be set for any users created by this role")),
                ("default_sts_ttl", FieldSchema::new(FieldType::DurationSeconds, "Default TTL for STS credentials")),
                ("max_sts_ttl", FieldSchema::new(FieldType::DurationSeconds, "Max allowed TTL for STS credentials")),
                ("user_path", FieldSchema::new(FieldType::String, "Path for IAM User. Only valid when credential_type is iam_user")),
                ("permissions_boundary_arn", FieldSchema::new(FieldType::String, "ARN of an IAM policy to attach as a permissions boundary on IAM user credentials")),
                ("policy", FieldSchema::new(FieldType::String, "Use policy_document instead.")),
                ("arn", FieldSchema::new(FieldType::String, "Use role_arns or policy_arns instead.")),
            ]))
            .existence_check(existence(this, IamBackend::role_exists))
            .operation(Operation::Read, handler(this, IamBackend::path_role_read))
            .operation(
                Operation::Create,
                PathOperation::new(handler(this, IamBackend::path_role_write)).forward_to_primary(),
            )
            .operation(
                Operation::Update,
                PathOperation::new(handler(this, IamBackend::path_role_write)).forward_to_primary(),
            )
            .operation(
                Operation::Delete,
                PathOperation::new(handler(this, IamBackend::path_role_delete)).forward_to_primary(),
            )
            .help(
                "Read, write and reference IAM policies that access keys can be made for.",
                "A role maps a name to the credential types it may issue and the\npolicies, groups and roles those credentials carry. Deleting a role\ndoes not revoke credentials already issued from it.",
            ),
    ]
}

impl IamBackend {
    async fn role_exists(self: Arc<Self>, req: Request, data: FieldData) -> Result<bool, Error> {
        let name = data.get_string("name")?;
        Ok(get_role(&*req.storage, &name).await?.is_some())
    }

    async fn path_role_list(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let mut names = req.storage.list(ROLE_PREFIX).await?;
        names.extend(req.storage.list(LEGACY_ROLE_PREFIX).await?);

        Ok(Some(Response::list(
            names.into_iter().sorted().dedup().collect(),
        )))
    }

    async fn path_role_read(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let name = data.get_string("name")?;
        Ok(get_role(&*req.storage, &name)
            .await?
            .map(|role| role.to_response()))
    }

    async fn path_role_delete(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let name = data.get_string("name")?;
        req.storage.delete(&format!("{ROLE_PREFIX}{name}")).await?;
        req.storage
            .delete(&format!("{LEGACY_ROLE_PREFIX}{name}"))
            .await?;
        Ok(None)
    }

    async fn path_role_write(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;
        let name = data.get_string("name")?;

        let mut role = get_role(storage, &name).await?.unwrap_or_default();
        role.legacy = false;

        let mut legacy_types = None;
        for field in ["policy", "arn"] {
            if let Some(value) = data.get_opt_string(field)?.filter(|v| !v.is_empty()) {
                if let Err(e) = apply_legacy(&mut role, &value) {
                    return error_response(e);
                }
                legacy_types = Some(role.credential_types.clone());
            }
        }

        if let Some(types) = data.get_opt_strings("credential_type")? {
            let mut parsed = Vec::with_capacity(types.len());
            for t in &types {
                let Ok(credential_type) = CredentialType::from_str(t) else {
                    return Ok(Some(Response::error(format!(
                        "unrecognized credential type: {t}"
                    ))));
                };
                parsed.push(credential_type);
            }
            role.credential_types = parsed;
        } else if let Some(types) = legacy_types {
            role.credential_types = types;
        }
        role.credential_types.sort();
        role.credential_types.dedup();

        if let Some(document) = data.get_opt_string("policy_document")? {
            role.policy_document = if document.trim().is_empty() {
                String::new()
            } else {
                match policy::compact(&document) {
                    Ok(compacted) => compacted,
                    Err(e) => return error_response(e),
                }
            };
        }
        if let Some(arns) = data.get_opt_strings("policy_arns")? {
            role.policy_arns = arns;
        }
        if let Some(arns) = data.get_opt_strings("role_arns")? {
            role.role_arns = arns;
        }
        if let Some(groups) = data.get_opt_strings("iam_groups")? {
            role.iam_groups = groups;
        }
        if let Some(tags) = data.get_opt_kv_pairs("iam_tags")? {
            role.iam_tags = tags;
        }
        if let Some(ttl) = data.get_opt_duration("default_sts_ttl")? {
            role.default_sts_ttl = ttl;
        }
        if let Some(ttl) = data.get_opt_duration("max_sts_ttl")? {
            role.max_sts_ttl = ttl;
        }
        if let Some(path) = data.get_opt_string("user_path")? {
            role.user_path = path;
        }
        if let Some(arn) = data.get_opt_string("permissions_boundary_arn")? {
            role.permissions_boundary_arn = arn;
        }

        if let Err(e) = role.validate() {
            return Ok(Some(Response::error(e.to_string())));
        }

        storage
            .put_json(&format!("{ROLE_PREFIX}{name}"), &role)
            .await?;

        Ok(None)
    }
}
