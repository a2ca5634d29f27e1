use std::sync::Arc;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::Error,
    framework::{
        field::fields, path::handler, FieldData, FieldSchema, FieldType, Operation, Path,
        PathOperation, Request, Response,
    },
    storage::Storage,
};

use super::IamBackend;

pub const LEASE_CONFIG_KEY: &str = "config/lease";

/// TTLs applied to `access_keys` leases, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub ttl: i64,
    pub max_ttl: i64,
}

impl LeaseConfig {
    /// The stored config, or zeros (defer to the mount) when none is stored.
    pub async fn load(storage: &dyn Storage) -> Result<Self, Error> {
        Ok(storage
            .get_json(LEASE_CONFIG_KEY)
            .await?
            .unwrap_or_default())
    }

    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::seconds(self.ttl)
    }

    pub fn max_ttl(&self) -> TimeDelta {
        TimeDelta::seconds(self.max_ttl)
    }
}

pub(super) fn paths(this: &Arc<IamBackend>) -> Vec<Path> {
    vec![Path::new("config/lease")
        .fields(fields([
            ("lease", FieldSchema::new(FieldType::DurationSeconds, "Default lease for roles.")),
            ("lease_max", FieldSchema::new(FieldType::DurationSeconds, "Maximum time a credential is valid for.")),
        ]))
        .operation(Operation::Read, handler(this, IamBackend::path_lease_read))
        .operation(
            Operation::Update,
            PathOperation::new(handler(this, IamBackend::path_lease_write)).forward_to_primary(),
        )
        .help(
            "Configure the default lease information for generated credentials.",
            "Sets the lease and maximum lease of access keys issued from creds/.\nRenewals never extend past the maximum.",
        )]
}

impl IamBackend {
    async fn path_lease_read(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let Some(lease) = req.storage.get_json::<LeaseConfig>(LEASE_CONFIG_KEY).await? else {
            return Ok(None);
        };

        Ok(Some(Response::json(json!({
            "lease": lease.ttl,
            "lease_max": lease.max_ttl,
        }))))
    }

    async fn path_lease_write(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let ttl = data.get_duration("lease")?;
        if ttl == 0 {
            return Ok(Some(Response::error("'lease' is a required parameter")));
        }

        let max_ttl = data.get_duration("lease_max")?;
        if max_ttl == 0 {
            return Ok(Some(Response::error("'lease_max' is a required parameter")));
        }

        req.storage
            .put_json(LEASE_CONFIG_KEY, &LeaseConfig { ttl, max_ttl })
            .await?;

        Ok(None)
    }
}
