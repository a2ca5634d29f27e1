use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::Error,
    framework::{
        field::fields,
        path::handler,
        FieldData, FieldSchema, FieldType, Operation, Path, PathOperation, Request, Response,
    },
    storage::Storage,
    utils::serialize_secret,
};

use super::{template::UsernameTemplate, IamBackend};

pub const ROOT_CONFIG_KEY: &str = "config/root";

/// Credentials and endpoints the engine uses to reach the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "empty_secret", serialize_with = "serialize_secret")]
    pub secret_key: SecretString,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub iam_endpoint: String,
    #[serde(default)]
    pub sts_endpoint: String,
    #[serde(default)]
    pub sts_region: String,
    #[serde(default)]
    pub sts_fallback_endpoints: Vec<String>,
    #[serde(default)]
    pub sts_fallback_regions: Vec<String>,
    /// Negative means the SDK default.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default)]
    pub username_template: String,
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_max_retries() -> i64 {
    -1
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: empty_secret(),
            region: String::new(),
            iam_endpoint: String::new(),
            sts_endpoint: String::new(),
            sts_region: String::new(),
            sts_fallback_endpoints: Vec::new(),
            sts_fallback_regions: Vec::new(),
            max_retries: default_max_retries(),
            username_template: String::new(),
        }
    }
}

impl RootConfig {
    pub async fn load(storage: &dyn Storage) -> Result<Option<Self>, Error> {
        storage.get_json(ROOT_CONFIG_KEY).await
    }

    pub async fn save(&self, storage: &dyn Storage) -> Result<(), Error> {
        storage.put_json(ROOT_CONFIG_KEY, self).await
    }

    pub fn iam_region(&self) -> &str {
        &self.region
    }

    pub fn sts_region(&self) -> &str {
        if self.sts_region.is_empty() {
            &self.region
        } else {
            &self.sts_region
        }
    }

    pub fn username_template(&self) -> Result<UsernameTemplate, Error> {
        if self.username_template.is_empty() {
            Ok(UsernameTemplate::default())
        } else {
            UsernameTemplate::parse(&self.username_template)
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.sts_fallback_regions.is_empty()
            && self.sts_fallback_endpoints.len() != self.sts_fallback_regions.len()
        {
            return Err(Error::validation(
                "number of regions does not match number of endpoints",
            ));
        }
        if self.sts_fallback_regions.is_empty() && !self.sts_fallback_endpoints.is_empty() {
            return Err(Error::validation(
                "sts_fallback_regions must be set when sts_fallback_endpoints is set",
            ));
        }
        self.username_template()?;
        Ok(())
    }
}

pub(super) fn paths(this: &Arc<IamBackend>) -> Vec<Path> {
    vec![
        Path::new("config/root")
            .fields(fields([
                ("access_key", FieldSchema::new(FieldType::String, "Access key with permission to create new keys.")),
                ("secret_key", FieldSchema::new(FieldType::String, "Secret key with permission to create new keys.")),
                ("region", FieldSchema::new(FieldType::String, "Region for API calls.")),
                ("iam_endpoint", FieldSchema::new(FieldType::String, "Endpoint to custom IAM server URL")),
                ("sts_endpoint", FieldSchema::new(FieldType::String, "Endpoint to custom STS server URL")),
                ("sts_region", FieldSchema::new(FieldType::String, "Specific region for STS API calls.")),
                ("sts_fallback_endpoints", FieldSchema::new(FieldType::CommaStringSlice, "Fallback endpoints if the STS endpoint fails")),
                ("sts_fallback_regions", FieldSchema::new(FieldType::CommaStringSlice, "Fallback regions matching sts_fallback_endpoints")),
                ("max_retries", FieldSchema::new(FieldType::Int, "Maximum number of retries for recoverable exceptions of AWS APIs").with_default(-1)),
                ("username_template", FieldSchema::new(FieldType::String, "Template to generate custom IAM usernames")),
            ]))
            .operation(Operation::Read, handler(this, IamBackend::path_config_root_read))
            .operation(
                Operation::Update,
                PathOperation::new(handler(this, IamBackend::path_config_root_write)).forward_to_primary(),
            )
            .help(
                "Configure the root credentials that are used to manage IAM.",
                "Before doing anything, the engine needs credentials that can create\nand delete IAM users and access keys. The secret key is never returned.",
            ),
        Path::new("config/rotate-root")
            .operation(
                Operation::Update,
                PathOperation::new(handler(this, IamBackend::path_config_rotate_root)).forward_to_primary(),
            )
            .help(
                "Request to rotate the root credentials this engine uses.",
                "Creates a new access key for the configured user, stores it, then\ndeletes the old one. The new access key id is returned.",
            ),
    ]
}

impl IamBackend {
    async fn path_config_root_read(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let Some(config) = RootConfig::load(&*req.storage).await? else {
            return Ok(None);
        };

        Ok(Some(Response::json(json!({
            "access_key": config.access_key,
            "region": config.region,
            "iam_endpoint": config.iam_endpoint,
            "sts_endpoint": config.sts_endpoint,
            "sts_region": config.sts_region,
            "sts_fallback_endpoints": config.sts_fallback_endpoints,
            "sts_fallback_regions": config.sts_fallback_regions,
            "max_retries": config.max_retries,
            "username_template": config.username_template,
        }))))
    }

    async fn path_config_root_write(
        self: Arc<Self>,
        req: Request,
        data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;
        let mut config = RootConfig::load(storage).await?.unwrap_or_default();

        let set = |key: &str| data.raw().contains_key(key);

        if set("access_key") {
            config.access_key = data.get_string("access_key")?;
        }
        if set("secret_key") {
            config.secret_key = SecretString::from(data.get_string("secret_key")?);
        }
        if set("region") {
            config.region = data.get_string("region")?;
        }
        if set("iam_endpoint") {
            config.iam_endpoint = data.get_string("iam_endpoint")?;
        }
        if set("sts_endpoint") {
            config.sts_endpoint = data.get_string("sts_endpoint")?;
        }
        if set("sts_region") {
            config.sts_region = data.get_string("sts_region")?;
        }
        if set("sts_fallback_endpoints") {
            config.sts_fallback_endpoints = data.get_strings("sts_fallback_endpoints")?;
        }
        if set("sts_fallback_regions") {
            config.sts_fallback_regions = data.get_strings("sts_fallback_regions")?;
        }
        if set("max_retries") {
            config.max_retries = data.get_int("max_retries")?;
        }
        if set("username_template") {
            config.username_template = data.get_string("username_template")?;
        }

        if let Err(e) = config.validate() {
            return Ok(Some(Response::error(e.to_string())));
        }

        config.save(storage).await?;
        self.reset_clients();

        Ok(None)
    }

    async fn path_config_rotate_root(
        self: Arc<Self>,
        req: Request,
        _data: FieldData,
    ) -> Result<Option<Response>, Error> {
        let storage = &*req.storage;

        let Some(mut config) = RootConfig::load(storage).await? else {
            return Err(Error::missing_config("root credentials"));
        };
        if config.access_key.is_empty() || config.secret_key.expose_secret().is_empty() {
            return Err(Error::validation(
                "Cannot call config/rotate-root when either access_key or secret_key is empty",
            ));
        }

        // Failures below only report the step. Cloud error text can echo the
        // credentials being replaced.
        let client = match self.iam_client(storage).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "could not build IAM client for root rotation");
                snafu::whatever!("error retrieving IAM client");
            }
        };

        let user = match client.get_user(None).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(code = ?e.code(), "GetUser failed during root rotation");
                snafu::whatever!("error calling GetUser");
            }
        };

        let new_key = match client.create_access_key(Some(&user.user_name)).await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(code = ?e.code(), "CreateAccessKey failed during root rotation");
                snafu::whatever!("error calling CreateAccessKey");
            }
        };

        let old_access_key = std::mem::replace(&mut config.access_key, new_key.access_key_id.clone());
        config.secret_key = new_key.secret_access_key;

        config.save(storage).await?;
        self.reset_clients();

        tracing::info!(username = %user.user_name, "rotated root access key");

        // The old client still authenticates with the key being deleted.
        if let Err(e) = client
            .delete_access_key(&old_access_key, Some(&user.user_name))
            .await
        {
            tracing::warn!(code = ?e.code(), "DeleteAccessKey failed during root rotation");
            snafu::whatever!("error deleting old access key");
        }

        Ok(Some(Response::json(json!({
            "access_key": new_key.access_key_id,
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_round_trips_through_storage_form() {
        let config = RootConfig {
            access_key: "AKIA".to_owned(),
            secret_key: SecretString::from("s3cr3t".to_owned()),
            ..Default::default()
        };

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: RootConfig = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.secret_key.expose_secret(), "s3cr3t");
        assert_eq!(decoded.max_retries, -1);
        assert!(!format!("{config:?}").contains("s3cr3t"));
    }

    #[test]
    fn test_fallback_lists_must_match() {
        let config = RootConfig {
            sts_fallback_endpoints: vec!["https://sts.us-west-2.amazonaws.com".to_owned()],
            sts_fallback_regions: vec!["us-west-2".to_owned(), "eu-west-1".to_owned()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RootConfig {
            sts_fallback_endpoints: vec!["https://sts.us-west-2.amazonaws.com".to_owned()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RootConfig {
            sts_fallback_endpoints: vec!["https://sts.us-west-2.amazonaws.com".to_owned()],
            sts_fallback_regions: vec!["us-west-2".to_owned()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sts_region_falls_back_to_region() {
        let mut config = RootConfig {
            region: "us-west-2".to_owned(),
            ..Default::default()
        };
        assert_eq!(config.sts_region(), "us-west-2");

        config.sts_region = "eu-west-1".to_owned();
        assert_eq!(config.sts_region(), "eu-west-1");
    }
}
