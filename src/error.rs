use itertools::Itertools;
use snafu::Snafu;

use crate::iam::IamError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{what} has not been configured"))]
    ConfigurationMissing { what: String },

    #[snafu(display("{message}"))]
    Validation { message: String },

    #[snafu(display("unsupported path: {path}"))]
    UnsupportedPath { path: String },

    #[snafu(display("unsupported operation: {operation}"))]
    UnsupportedOperation { operation: String },

    #[snafu(display("Error accessing storage"))]
    Storage {
        #[snafu(source(false))]
        source: eyre::Report,
    },

    #[snafu(display("{action}: {source}"))]
    CloudApi { action: String, source: IamError },

    #[snafu(display("{message}"))]
    CredentialInUse { message: String },

    #[snafu(display("past the max TTL, cannot renew"))]
    PastMaxTtl,

    #[snafu(display("error rolling back {kind:?} entry {wal_id}: {source}"))]
    CrashRecoveryPending {
        wal_id: String,
        kind: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("operation cancelled"))]
    Cancelled,

    #[snafu(display("cannot write to this node, operation must run on the primary"))]
    ReadOnly,

    #[snafu(display("{} errors occurred: {}", errors.len(), errors.iter().map(|e| e.to_string()).join("; ")))]
    Multiple { errors: Vec<Error> },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Storage {
            source: source.into(),
        }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn opaque() -> Self {
        Self::InternalServerError { source: None }
    }

    pub fn storage(e: impl Into<eyre::Report>) -> Self {
        Self::Storage { source: e.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn missing_config(what: impl Into<String>) -> Self {
        Self::ConfigurationMissing { what: what.into() }
    }

    pub fn cloud(action: impl Into<String>, source: IamError) -> Self {
        Self::CloudApi {
            action: action.into(),
            source,
        }
    }

    pub fn unsupported_path(path: impl Into<String>) -> Self {
        Self::UnsupportedPath { path: path.into() }
    }

    pub fn unsupported_operation(operation: impl ToString) -> Self {
        Self::UnsupportedOperation {
            operation: operation.to_string(),
        }
    }

    pub fn credential_in_use(message: impl Into<String>) -> Self {
        Self::CredentialInUse {
            message: message.into(),
        }
    }

    /// Collapses accumulated errors: none is success, one is returned as-is.
    pub fn from_many(mut errors: Vec<Error>) -> Result<(), Self> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple { errors }),
        }
    }

    /// Whether the caller, rather than the server, is at fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::ConfigurationMissing { .. }
                | Self::UnsupportedPath { .. }
                | Self::UnsupportedOperation { .. }
                | Self::CredentialInUse { .. }
                | Self::PastMaxTtl
        )
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            Self::ConfigurationMissing { .. }
            | Self::Validation { .. }
            | Self::CredentialInUse { .. }
            | Self::PastMaxTtl => StatusCode::BAD_REQUEST,
            Self::UnsupportedPath { .. } => StatusCode::NOT_FOUND,
            Self::UnsupportedOperation { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::CloudApi { .. } => StatusCode::BAD_GATEWAY,
            Self::ReadOnly | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,

            Self::Storage { .. }
            | Self::CrashRecoveryPending { .. }
            | Self::Multiple { .. }
            | Self::InternalServerError { .. }
            | Self::Whatever { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "errors": [self.to_string()] }))
    }
}
