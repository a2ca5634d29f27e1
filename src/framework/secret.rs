use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{
    field::FieldMap,
    path::OperationFunc,
    response::{Response, SecretLease},
};

/// A kind of credential the backend issues under a lease.
#[derive(Clone)]
pub struct Secret {
    pub kind: String,
    pub fields: Arc<FieldMap>,
    pub renew: Option<OperationFunc>,
    pub revoke: Option<OperationFunc>,
}

impl Secret {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Arc::default(),
            renew: None,
            revoke: None,
        }
    }

    pub fn renewable(&self) -> bool {
        self.renew.is_some()
    }

    /// Wraps `data` in a response whose lease is tagged with this secret's kind.
    pub fn response(
        &self,
        data: Map<String, Value>,
        mut internal_data: Map<String, Value>,
        issue_time: DateTime<Utc>,
    ) -> Response {
        internal_data.insert(
            SecretLease::SECRET_TYPE.to_owned(),
            Value::String(self.kind.clone()),
        );

        Response {
            data: Some(data),
            secret: Some(SecretLease {
                renewable: self.renewable(),
                issue_time: Some(issue_time),
                internal_data,
                ..Default::default()
            }),
            warnings: Vec::new(),
        }
    }
}
