//! AWS SDK implementation of the IAM and STS facades.

use aws_sdk_iam::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::Tag,
};
use aws_sdk_sts::types::PolicyDescriptorType;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use super::{
    AccessKey, AccessKeyMetadata, AssumeRoleInput, CreateUserInput, FederationTokenInput,
    IamClient, IamError, IamResult, IamUser, StsClient, StsCredentials,
};

impl<E, R> From<SdkError<E, R>> for IamError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    fn from(err: SdkError<E, R>) -> Self {
        match err.code() {
            Some(code) => IamError::api(code, err.message().unwrap_or_default()),
            None => IamError::Transport {
                message: DisplayErrorContext(&err).to_string(),
            },
        }
    }
}

fn missing(what: &str) -> IamError {
    IamError::Transport {
        message: format!("response did not include {what}"),
    }
}

fn to_chrono(dt: &aws_sdk_iam::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[derive(Clone)]
pub struct AwsIamClient {
    client: aws_sdk_iam::Client,
}

impl AwsIamClient {
    pub fn new(client: aws_sdk_iam::Client) -> Self {
        Self { client }
    }
}

impl IamClient for AwsIamClient {
    fn create_user(&self, input: CreateUserInput) -> IamResult<'_, IamUser> {
        Box::pin(async move {
            let tags = input
                .tags
                .iter()
                .map(|(k, v)| Tag::builder().key(k).value(v).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| IamError::Transport {
                    message: e.to_string(),
                })?;

            let resp = self
                .client
                .create_user()
                .user_name(&input.user_name)
                .set_path(input.path)
                .set_permissions_boundary(input.permissions_boundary)
                .set_tags((!tags.is_empty()).then_some(tags))
                .send()
                .await?;

            let user = resp.user().ok_or_else(|| missing("a user"))?;

            Ok(IamUser {
                user_name: user.user_name().to_owned(),
                arn: user.arn().to_owned(),
            })
        })
    }

    fn get_user<'a>(&'a self, user_name: Option<&'a str>) -> IamResult<'a, IamUser> {
        Box::pin(async move {
            let resp = self
                .client
                .get_user()
                .set_user_name(user_name.map(str::to_owned))
                .send()
                .await?;

            let user = resp.user().ok_or_else(|| missing("a user"))?;

            Ok(IamUser {
                user_name: user.user_name().to_owned(),
                arn: user.arn().to_owned(),
            })
        })
    }

    fn delete_user<'a>(&'a self, user_name: &'a str) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client.delete_user().user_name(user_name).send().await?;
            Ok(())
        })
    }

    fn put_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_name: &'a str,
        policy_document: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .put_user_policy()
                .user_name(user_name)
                .policy_name(policy_name)
                .policy_document(policy_document)
                .send()
                .await?;
            Ok(())
        })
    }

    fn delete_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_name: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .delete_user_policy()
                .user_name(user_name)
                .policy_name(policy_name)
                .send()
                .await?;
            Ok(())
        })
    }

    fn list_user_policies<'a>(&'a self, user_name: &'a str) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut names = Vec::new();
            let mut marker = None;
            loop {
                let resp = self
                    .client
                    .list_user_policies()
                    .user_name(user_name)
                    .set_marker(marker.take())
                    .send()
                    .await?;

                names.extend(resp.policy_names().iter().cloned());

                match resp.marker() {
                    Some(next) if resp.is_truncated() => marker = Some(next.to_owned()),
                    _ => break,
                }
            }
            Ok(names)
        })
    }

    fn attach_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_arn: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .attach_user_policy()
                .user_name(user_name)
                .policy_arn(policy_arn)
                .send()
                .await?;
            Ok(())
        })
    }

    fn detach_user_policy<'a>(
        &'a self,
        user_name: &'a str,
        policy_arn: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .detach_user_policy()
                .user_name(user_name)
                .policy_arn(policy_arn)
                .send()
                .await?;
            Ok(())
        })
    }

    fn list_attached_user_policies<'a>(
        &'a self,
        user_name: &'a str,
    ) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut arns = Vec::new();
            let mut marker = None;
            loop {
                let resp = self
                    .client
                    .list_attached_user_policies()
                    .user_name(user_name)
                    .set_marker(marker.take())
                    .send()
                    .await?;

                arns.extend(
                    resp.attached_policies()
                        .iter()
                        .filter_map(|p| p.policy_arn().map(str::to_owned)),
                );

                match resp.marker() {
                    Some(next) if resp.is_truncated() => marker = Some(next.to_owned()),
                    _ => break,
                }
            }
            Ok(arns)
        })
    }

    fn add_user_to_group<'a>(
        &'a self,
        user_name: &'a str,
        group_name: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .add_user_to_group()
                .user_name(user_name)
                .group_name(group_name)
                .send()
                .await?;
            Ok(())
        })
    }

    fn remove_user_from_group<'a>(
        &'a self,
        user_name: &'a str,
        group_name: &'a str,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .remove_user_from_group()
                .user_name(user_name)
                .group_name(group_name)
                .send()
                .await?;
            Ok(())
        })
    }

    fn list_groups_for_user<'a>(&'a self, user_name: &'a str) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut groups = Vec::new();
            let mut marker = None;
            loop {
                let resp = self
                    .client
                    .list_groups_for_user()
                    .user_name(user_name)
                    .set_marker(marker.take())
                    .send()
                    .await?;

                groups.extend(resp.groups().iter().map(|g| g.group_name().to_owned()));

                match resp.marker() {
                    Some(next) if resp.is_truncated() => marker = Some(next.to_owned()),
                    _ => break,
                }
            }
            Ok(groups)
        })
    }

    fn create_access_key<'a>(&'a self, user_name: Option<&'a str>) -> IamResult<'a, AccessKey> {
        Box::pin(async move {
            let resp = self
                .client
                .create_access_key()
                .set_user_name(user_name.map(str::to_owned))
                .send()
                .await?;

            let key = resp.access_key().ok_or_else(|| missing("an access key"))?;

            Ok(AccessKey {
                user_name: key.user_name().to_owned(),
                access_key_id: key.access_key_id().to_owned(),
                secret_access_key: SecretString::from(key.secret_access_key().to_owned()),
            })
        })
    }

    fn delete_access_key<'a>(
        &'a self,
        access_key_id: &'a str,
        user_name: Option<&'a str>,
    ) -> IamResult<'a, ()> {
        Box::pin(async move {
            self.client
                .delete_access_key()
                .access_key_id(access_key_id)
                .set_user_name(user_name.map(str::to_owned))
                .send()
                .await?;
            Ok(())
        })
    }

    fn list_access_keys<'a>(
        &'a self,
        user_name: Option<&'a str>,
    ) -> IamResult<'a, Vec<AccessKeyMetadata>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut marker = None;
            loop {
                let resp = self
                    .client
                    .list_access_keys()
                    .set_user_name(user_name.map(str::to_owned))
                    .set_marker(marker.take())
                    .send()
                    .await?;

                keys.extend(resp.access_key_metadata().iter().filter_map(|k| {
                    Some(AccessKeyMetadata {
                        user_name: k.user_name().unwrap_or_default().to_owned(),
                        access_key_id: k.access_key_id()?.to_owned(),
                        create_date: k.create_date().and_then(to_chrono),
                    })
                }));

                match resp.marker() {
                    Some(next) if resp.is_truncated() => marker = Some(next.to_owned()),
                    _ => break,
                }
            }
            Ok(keys)
        })
    }

    fn list_attached_group_policies<'a>(
        &'a self,
        group_name: &'a str,
    ) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut arns = Vec::new();
            let mut marker = None;
            loop {
                let resp = self
                    .client
                    .list_attached_group_policies()
                    .group_name(group_name)
                    .set_marker(marker.take())
                    .send()
                    .await?;

                arns.extend(
                    resp.attached_policies()
                        .iter()
                        .filter_map(|p| p.policy_arn().map(str::to_owned)),
                );

                match resp.marker() {
                    Some(next) if resp.is_truncated() => marker = Some(next.to_owned()),
                    _ => break,
                }
            }
            Ok(arns)
        })
    }

    fn list_group_policies<'a>(&'a self, group_name: &'a str) -> IamResult<'a, Vec<String>> {
        Box::pin(async move {
            let mut names = Vec::new();
            let mut marker = None;
            loop {
                let resp = self
                    .client
                    .list_group_policies()
                    .group_name(group_name)
                    .set_marker(marker.take())
                    .send()
                    .await?;

                names.extend(resp.policy_names().iter().cloned());

                match resp.marker() {
                    Some(next) if resp.is_truncated() => marker = Some(next.to_owned()),
                    _ => break,
                }
            }
            Ok(names)
        })
    }

    fn get_group_policy<'a>(
        &'a self,
        group_name: &'a str,
        policy_name: &'a str,
    ) -> IamResult<'a, String> {
        Box::pin(async move {
            let resp = self
                .client
                .get_group_policy()
                .group_name(group_name)
                .policy_name(policy_name)
                .send()
                .await?;

            // IAM returns policy documents URL-encoded.
            let decoded = urlencoding::decode(resp.policy_document()).map_err(|e| {
                IamError::Transport {
                    message: format!("error decoding policy document: {e}"),
                }
            })?;

            Ok(decoded.into_owned())
        })
    }
}

/// STS client that tries each configured endpoint in order.
///
/// An endpoint is only skipped when the request never reached the service;
/// an error response from the service is returned as-is.
#[derive(Clone)]
pub struct AwsStsClient {
    clients: Vec<aws_sdk_sts::Client>,
}

impl AwsStsClient {
    pub fn new(clients: Vec<aws_sdk_sts::Client>) -> Self {
        Self { clients }
    }

    fn descriptors(arns: &[String]) -> Option<Vec<PolicyDescriptorType>> {
        (!arns.is_empty()).then(|| {
            arns.iter()
                .map(|arn| PolicyDescriptorType::builder().arn(arn).build())
                .collect()
        })
    }

    fn credentials(creds: Option<&aws_sdk_sts::types::Credentials>) -> Result<StsCredentials, IamError> {
        let creds = creds.ok_or_else(|| missing("credentials"))?;

        Ok(StsCredentials {
            access_key_id: creds.access_key_id().to_owned(),
            secret_access_key: SecretString::from(creds.secret_access_key().to_owned()),
            session_token: SecretString::from(creds.session_token().to_owned()),
            expiration: to_chrono(creds.expiration()),
        })
    }
}

fn duration(seconds: i64) -> Option<i32> {
    (seconds > 0).then(|| i32::try_from(seconds).unwrap_or(i32::MAX))
}

impl StsClient for AwsStsClient {
    fn assume_role(&self, input: AssumeRoleInput) -> IamResult<'_, StsCredentials> {
        Box::pin(async move {
            let mut last = missing("a configured STS endpoint");

            for client in &self.clients {
                let result = client
                    .assume_role()
                    .role_arn(&input.role_arn)
                    .role_session_name(&input.role_session_name)
                    .set_policy(input.policy.clone())
                    .set_policy_arns(Self::descriptors(&input.policy_arns))
                    .set_duration_seconds(duration(input.duration_seconds))
                    .send()
                    .await;

                match result {
                    Ok(resp) => return Self::credentials(resp.credentials()),
                    Err(e) => match IamError::from(e) {
                        e @ IamError::Api { .. } => return Err(e),
                        e => {
                            tracing::warn!(error = %e, "STS endpoint unreachable, trying next");
                            last = e;
                        }
                    },
                }
            }

            Err(last)
        })
    }

    fn get_federation_token(&self, input: FederationTokenInput) -> IamResult<'_, StsCredentials> {
        Box::pin(async move {
            let mut last = missing("a configured STS endpoint");

            for client in &self.clients {
                let result = client
                    .get_federation_token()
                    .name(&input.name)
                    .set_policy(input.policy.clone())
                    .set_policy_arns(Self::descriptors(&input.policy_arns))
                    .set_duration_seconds(duration(input.duration_seconds))
                    .send()
                    .await;

                match result {
                    Ok(resp) => return Self::credentials(resp.credentials()),
                    Err(e) => match IamError::from(e) {
                        e @ IamError::Api { .. } => return Err(e),
                        e => {
                            tracing::warn!(error = %e, "STS endpoint unreachable, trying next");
                            last = e;
                        }
                    },
                }
            }

            Err(last)
        })
    }
}
