use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};

/// Lease attached to an issued credential.
///
/// `internal_data` is never shown to the caller. The broker hands it back
/// verbatim on renew and revoke, and the `secret_type` key inside it selects
/// which secret type handles the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretLease {
    pub ttl: TimeDelta,
    pub max_ttl: TimeDelta,
    pub grace: TimeDelta,
    pub renewable: bool,
    /// Renewal increment requested by the caller.
    pub increment: TimeDelta,
    pub issue_time: Option<DateTime<Utc>>,
    pub internal_data: Map<String, Value>,
}

impl SecretLease {
    pub const SECRET_TYPE: &'static str = "secret_type";

    pub fn secret_type(&self) -> Option<&str> {
        self.internal_data
            .get(Self::SECRET_TYPE)
            .and_then(Value::as_str)
    }

    pub fn internal_str(&self, key: &str) -> Option<&str> {
        self.internal_data.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub data: Option<Map<String, Value>>,
    pub secret: Option<SecretLease>,
    pub warnings: Vec<String>,
}

impl Response {
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Builds a response from a JSON object literal. Non-objects yield an empty response.
    pub fn json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::with_data(map),
            _ => Self::default(),
        }
    }

    /// A user-facing failure carried in the response body rather than as an `Err`.
    pub fn error(message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_owned(), Value::String(message.into()));
        Self::with_data(data)
    }

    pub fn list(keys: Vec<String>) -> Self {
        let mut data = Map::new();
        data.insert(
            "keys".to_owned(),
            Value::Array(keys.into_iter().map(Value::String).collect()),
        );
        Self::with_data(data)
    }

    pub fn help(text: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("help".to_owned(), Value::String(text.into()));
        Self::with_data(data)
    }

    pub fn is_error(&self) -> bool {
        self.error_message().is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(Value::as_str)
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}
