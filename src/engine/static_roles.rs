//! Static roles: existing IAM users whose access key the engine rotates.

use std::sync::Arc;

use chrono::TimeDelta;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::Error,
    framework::{
        field::fields,
        path::{existence, handler},
        FieldData, FieldSchema, FieldType, Operation, Path, PathOperation, Request, Response,
    },
    storage::Storage,
    utils::serialize_secret,
};

use super::{queue::RotationItem, IamBackend, NAME_PATTERN};

pub const STATIC_ROLE_PREFIX: &str = "static-roles/";
pub const STATIC_CREDS_PREFIX: &str = "static-creds/";

/// Rotation periods below one second are never accepted.
pub(crate) const MIN_ROTATION_PERIOD_SECS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoleConfig {
    pub name: String,
    pub username: String,
    /// Seconds between rotations.
    pub rotation_period: i64,
}

impl StaticRoleConfig {
    pub fn rotation_period(&self) -> TimeDelta {
        TimeDelta::seconds(self.rotation_period)
    }

    pub async fn load(storage: &dyn Storage, name: &str) -> Result<Option<Self>, Error> {
        storage.get_json(&static_role_key(name)).await
    }

    fn to_response(&self) -> Response {
        Response::json(json!({
            "name": self.name,
            "username": self.username,
            "rotation_period": self.rotation_period,
        }))
    }
}

/// The current access key of a static role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticCredentials {
    pub access_key_id: String,
    #[serde(serialize_with = "serialize_secret")]
    pub secret_access_key: SecretString,
}

impl StaticCredentials {
    pub async fn load(storage: &dyn Storage, name: &str) -> Result<Option<Self>, Error> {
        storage.get_json(&static_creds_key(name)).await
    }
}

pub fn static_role_key(name: &str) -> String {
    format!("{STATIC_ROLE_PREFIX}{name}")
}

pub fn static_creds_key(name: &str) -> String {
    format!("{STATIC_CREDS_PREFIX}{name}")
}

pub(super) fn paths(this: &Arc<IamBackend>) -> Vec<Path> {
    vec![
        Path::new("static-roles/?$")
            .operation(Operation::List, handler(this, IamBackend::path_static_role_list))
            .help("List the existing static roles in this backend", "Static roles are listed by name."),
        Path::new(format!("static-roles/{NAME_PATTERN}"))
            .fields(fields([
                ("name", FieldSchema::new(FieldType::NameString, "The name of this role.")),
                ("username", FieldSchema::new(FieldType::String, "The IAM user to adopt as a static role.")),
                ("rotation_period", FieldSchema::new(FieldType::DurationSeconds, "Period by which to rotate the backing credential of the adopted user.")),
            ]))
            .existence_check(existence(this, IamBackend::static_role_exists))
            .operation(Operation::Read, handler(this, IamBackend::path_static_role_read))
            .operation(
                Operation::Create,
                PathOperation::new(handler(this, IamBackend::path_static_role_write)).forward_to_primary(),
            )
            .operation(
                Operation::Update,
                PathOperation::new(handler(this, IamBackend::path_static_role_write)).forward_to_primary(),
            )
            .operation(
                Operation::Delete,
                PathOperation::new(handler(this, IamBackend::path_static_role_delete)).forward_to_primary(),
            )
            .help(
                "Manage static roles for AWS.",
                "A static role adopts an existing IAM user. Its access key is created\nwhen the role is written and replaced every rotation period.",
            ),
        Path::new(format!("static-creds/{NAME_PATTERN}"))
            .fields(fields([(
                "name",
                FieldSchema::new(FieldType::NameString, "The name of this static role."),
            )]))
            .operation(Operation::Read, handler(this, IamBackend::path_static_creds_read))
            .help(
                "Retrieve static credentials from the named role.",
                "Returns the access key currently held for the static role.",
            ),
    ]
}

impl IamBackend {
    fn validate_rotation_period(&self, period: TimeDelta) -> Result<(), Error> {
        let min = self
            .config
            .min_rotation_period
            .max(TimeDelta::seconds(MIN_ROTATION_PERIOD_SECS));
        if period < min {
            return Err(Error::credential_in_use(format!(
                "rotation_period must be at least {}s",
                min.num_seconds()
            )));
        }
        if let Some(max) = self.config.max_rotation_period {
            if period > max {
                return Err(Error::credential_in_use(format!(
                    "rotation_period must be at most {}s",
                    max.num_seconds()
                )));
            }
        }
        Ok(())
    }

    async fn static_role_exists(self: Arc<Self>, req: Request, data: FieldData) -> Result<bool, Error> {
        let name = data.get_string("name")?;
        Ok(StaticRoleConfig::load(&*req.storage, &name).await?.is_some())
    }

    async fn path_static_role_list(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        Ok(Some(Response::list(req.storage.list(STATIC_ROLE_PREFIX).await?)))
    }

    async fn path_static_role_read(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let name = data.get_string("name")?;
        Ok(StaticRoleConfig::load(&*req.storage, &name)
            .await?
            .map(|config| config.to_response()))
    }

    async fn path_static_role_write(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;
        let name = data.get_string("name")?;
        let username = data.get_opt_string("username")?.filter(|u| !u.is_empty());
        let period = data.get_opt_duration("rotation_period")?;

        let mut config = match StaticRoleConfig::load(storage, &name).await? {
            Some(existing) => {
                if let Some(username) = username.filter(|u| *u != existing.username) {
                    return Err(Error::credential_in_use(format!(
                        "cannot change the username of static role {name:?} from {:?} to {username:?}",
                        existing.username
                    )));
                }
                existing
            }
            None => {
                let Some(username) = username else {
                    return Ok(Some(Response::error("missing \"username\" parameter")));
                };
                if period.is_none() {
                    return Ok(Some(Response::error("missing \"rotation_period\" parameter")));
                }
                StaticRoleConfig {
                    name: name.clone(),
                    username,
                    rotation_period: 0,
                }
            }
        };

        if let Some(period) = period {
            config.rotation_period = period;
        }
        self.validate_rotation_period(config.rotation_period())?;

        self.iam_client(storage)
            .await?
            .list_access_keys(Some(&config.username))
            .await
            .map_err(|e| Error::cloud("Error validating IAM user", e))?;

        storage.put_json(&static_role_key(&name), &config).await?;

        let now = self.clock().now();
        if storage.get(&static_creds_key(&name)).await?.is_none() {
            // A failed bootstrap stays queued as due so the next drain retries it.
            let bootstrapped = self.create_credential(storage, &config).await;
            let next = match bootstrapped {
                Ok(()) => now + config.rotation_period(),
                Err(_) => now,
            };
            self.shared().queue.push(RotationItem {
                key: name.clone(),
                priority: next.timestamp(),
                value: config.clone(),
            });
            bootstrapped?;
        } else {
            let mut shared = self.shared();
            if !shared.queue.update_value(&name, config.clone()) {
                shared.queue.push(RotationItem {
                    key: name.clone(),
                    priority: (now + config.rotation_period()).timestamp(),
                    value: config.clone(),
                });
            }
        }

        tracing::debug!(role = %name, username = %config.username, "wrote static role");

        Ok(Some(config.to_response()))
    }

    async fn path_static_role_delete(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let name = data.get_string("name")?;
        req.storage.delete(&static_creds_key(&name)).await?;
        req.storage.delete(&static_role_key(&name)).await?;
        self.shared().queue.remove(&name);
        Ok(None)
    }

    async fn path_static_creds_read(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let name = data.get_string("name")?;
        let Some(creds) = StaticCredentials::load(&*req.storage, &name).await? else {
            return Ok(None);
        };

        Ok(Some(Response::json(json!({
            "access_key_id": creds.access_key_id,
            "secret_access_key": creds.secret_access_key.expose_secret(),
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = StaticCredentials {
            access_key_id: "AKIA16".to_owned(),
            secret_access_key: SecretString::from("SEC16".to_owned()),
        };

        assert!(!format!("{creds:?}").contains("SEC16"));

        let stored = serde_json::to_value(&creds).unwrap();
        assert_eq!(
            stored,
            json!({"access_key_id": "AKIA16", "secret_access_key": "SEC16"})
        );
    }
}
