//! Construction of cloud clients from the stored root config.

use std::sync::Arc;

use aws_config::{meta::region::RegionProviderChain, retry::RetryConfig, BehaviorVersion, Region};
use futures_util::future::BoxFuture;
use secrecy::ExposeSecret;

use crate::{
    error::Error,
    iam::{
        aws::{AwsIamClient, AwsStsClient},
        IamClient, StsClient,
    },
};

use super::config_root::RootConfig;

const FALLBACK_REGION: &str = "us-east-1";

/// Builds IAM and STS clients. `config` is `None` before `config/root` is written.
pub trait ClientFactory: Send + Sync + 'static {
    fn iam<'a>(
        &'a self,
        config: Option<&'a RootConfig>,
    ) -> BoxFuture<'a, Result<Arc<dyn IamClient>, Error>>;

    fn sts<'a>(
        &'a self,
        config: Option<&'a RootConfig>,
    ) -> BoxFuture<'a, Result<Arc<dyn StsClient>, Error>>;
}

/// Talks to AWS. Without explicit keys the default credential chain applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsClientFactory;

impl AwsClientFactory {
    async fn sdk_config(config: Option<&RootConfig>, region: Option<&str>) -> aws_config::SdkConfig {
        let region = RegionProviderChain::first_try(
            region
                .filter(|r| !r.is_empty())
                .map(|r| Region::new(r.to_owned())),
        )
        .or_default_provider()
        .or_else(Region::new(FALLBACK_REGION));

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);

        if let Some(config) = config {
            if !config.access_key.is_empty() {
                loader = loader.credentials_provider(aws_sdk_iam::config::Credentials::new(
                    config.access_key.clone(),
                    config.secret_key.expose_secret().to_owned(),
                    None,
                    None,
                    "credvault",
                ));
            }
            if let Ok(retries) = u32::try_from(config.max_retries) {
                loader = loader.retry_config(RetryConfig::standard().with_max_attempts(retries + 1));
            }
        }

        loader.load().await
    }
}

impl ClientFactory for AwsClientFactory {
    fn iam<'a>(
        &'a self,
        config: Option<&'a RootConfig>,
    ) -> BoxFuture<'a, Result<Arc<dyn IamClient>, Error>> {
        Box::pin(async move {
            let region = config.map(|c| c.iam_region());
            let sdk = Self::sdk_config(config, region).await;

            let mut builder = aws_sdk_iam::config::Builder::from(&sdk);
            if let Some(endpoint) = config.map(|c| c.iam_endpoint.as_str()).filter(|e| !e.is_empty()) {
                builder = builder.endpoint_url(endpoint);
            }

            let client = aws_sdk_iam::Client::from_conf(builder.build());
            Ok(Arc::new(AwsIamClient::new(client)) as Arc<dyn IamClient>)
        })
    }

    fn sts<'a>(
        &'a self,
        config: Option<&'a RootConfig>,
    ) -> BoxFuture<'a, Result<Arc<dyn StsClient>, Error>> {
        Box::pin(async move {
            let mut targets = vec![(
                config.map(|c| c.sts_endpoint.clone()).unwrap_or_default(),
                config.map(|c| c.sts_region().to_owned()).unwrap_or_default(),
            )];
            if let Some(config) = config {
                targets.extend(
                    config
                        .sts_fallback_endpoints
                        .iter()
                        .cloned()
                        .zip(config.sts_fallback_regions.iter().cloned()),
                );
            }

            let mut clients = Vec::with_capacity(targets.len());
            for (endpoint, region) in targets {
                let sdk = Self::sdk_config(config, Some(region.as_str())).await;

                let mut builder = aws_sdk_sts::config::Builder::from(&sdk);
                if !endpoint.is_empty() {
                    builder = builder.endpoint_url(endpoint);
                }
                clients.push(aws_sdk_sts::Client::from_conf(builder.build()));
            }

            Ok(Arc::new(AwsStsClient::new(clients)) as Arc<dyn StsClient>)
        })
    }
}

/// Hands out fixed clients regardless of the root config.
#[derive(Clone)]
pub struct StaticClientFactory {
    iam: Arc<dyn IamClient>,
    sts: Arc<dyn StsClient>,
}

impl StaticClientFactory {
    pub fn new(iam: Arc<dyn IamClient>, sts: Arc<dyn StsClient>) -> Self {
        Self { iam, sts }
    }
}

impl ClientFactory for StaticClientFactory {
    fn iam<'a>(
        &'a self,
        _config: Option<&'a RootConfig>,
    ) -> BoxFuture<'a, Result<Arc<dyn IamClient>, Error>> {
        Box::pin(async move { Ok(self.iam.clone()) })
    }

    fn sts<'a>(
        &'a self,
        _config: Option<&'a RootConfig>,
    ) -> BoxFuture<'a, Result<Arc<dyn StsClient>, Error>> {
        Box::pin(async move { Ok(self.sts.clone()) })
    }
}
