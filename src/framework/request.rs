use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::storage::Storage;

use super::response::SecretLease;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
    Renew,
    Revoke,
    Rollback,
    Help,
}

/// A request forwarded by the broker.
///
/// `path` is relative to the mount point and has no leading slash. `secret`
/// is only set for renew and revoke, and carries the lease the broker is
/// acting on.
#[derive(Clone)]
pub struct Request {
    pub operation: Operation,
    pub path: String,
    pub data: Map<String, Value>,
    pub display_name: String,
    pub secret: Option<SecretLease>,
    pub storage: Arc<dyn Storage>,
    pub cancel: CancellationToken,
}

impl Request {
    pub fn new(operation: Operation, path: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Map::new(),
            display_name: String::new(),
            secret: None,
            storage,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_secret(mut self, secret: SecretLease) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("operation", &self.operation)
            .field("path", &self.path)
            .field("fields", &self.data.keys().collect::<Vec<_>>())
            .field("display_name", &self.display_name)
            .field("has_secret", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Rollback.to_string(), "rollback");
        assert_eq!(Operation::from_str("update").unwrap(), Operation::Update);
        assert!(Operation::from_str("write").is_err());
    }
}
