//! Access key rotation for static roles.
//!
//! A due item is re-queued for its next period before its credential is
//! touched, so a crash mid-rotation still leaves the role scheduled. Each
//! user holds at most two keys: the oldest is deleted before a new one is
//! created.

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, storage::Storage};

use super::{
    queue::RotationItem,
    static_roles::{
        static_creds_key, static_role_key, StaticCredentials, StaticRoleConfig,
        MIN_ROTATION_PERIOD_SECS, STATIC_ROLE_PREFIX,
    },
    IamBackend,
};

/// The delay before the following rotation. Stored roles may predate the
/// period bounds, so a non-positive period still moves the item forward.
fn next_period(config: &StaticRoleConfig) -> TimeDelta {
    config
        .rotation_period()
        .max(TimeDelta::seconds(MIN_ROTATION_PERIOD_SECS))
}

impl IamBackend {
    /// Replaces the access key of `config.username` and stores the new one.
    pub(crate) async fn create_credential(
        &self,
        storage: &dyn Storage,
        config: &StaticRoleConfig,
    ) -> Result<(), Error> {
        let iam = self.iam_client(storage).await?;
        let username = config.username.as_str();

        let keys = iam
            .list_access_keys(Some(username))
            .await
            .map_err(|e| Error::cloud("Error listing access keys", e))?;

        if keys.len() >= 2 {
            // `min_by_key` keeps the first of equal elements.
            if let Some(oldest) = keys.iter().min_by_key(|k| k.create_date) {
                iam.delete_access_key(&oldest.access_key_id, Some(username))
                    .await
                    .map_err(|e| Error::cloud("Error deleting oldest access key", e))?;
            }
        }

        let key = iam
            .create_access_key(Some(username))
            .await
            .map_err(|e| Error::cloud("Error creating access key", e))?;

        storage
            .put_json(
                &static_creds_key(&config.name),
                &StaticCredentials {
                    access_key_id: key.access_key_id,
                    secret_access_key: key.secret_access_key,
                },
            )
            .await?;

        tracing::info!(role = %config.name, %username, "rotated static role credential");

        Ok(())
    }

    /// Rotates every queued role whose deadline has passed.
    ///
    /// A failed rotation does not stop the drain; all failures are returned
    /// together. Cancellation re-queues the interrupted item unchanged.
    pub(crate) async fn rotate_expired(
        &self,
        storage: &dyn Storage,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut errors = Vec::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let now = self.clock().now();

            let Some(item) = self.shared().queue.pop() else {
                break;
            };
            if item.priority > now.timestamp() {
                self.shared().queue.push(item);
                break;
            }

            // Deleted roles leave their item behind; drop it here.
            match storage.get(&static_role_key(&item.key)).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(role = %item.key, "static role deleted, dropping from rotation queue");
                    continue;
                }
                Err(e) => {
                    self.shared().queue.push(item);
                    errors.push(e);
                    break;
                }
            }

            let original = item.priority;
            self.shared().queue.push(RotationItem {
                key: item.key.clone(),
                priority: (now + next_period(&item.value)).timestamp(),
                value: item.value.clone(),
            });

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.create_credential(storage, &item.value) => result,
            };

            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    self.shared().queue.push(RotationItem {
                        priority: original,
                        ..item
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(role = %item.key, error = %e, "static role rotation failed");
                    errors.push(e);
                }
            }
        }

        Error::from_many(errors)
    }

    /// Queues every persisted static role, then drains what is due.
    ///
    /// Roles without a stored credential are due immediately.
    pub(crate) async fn rehydrate_queue(&self, storage: &dyn Storage) -> Result<(), Error> {
        let now = self.clock().now();

        for name in storage.list(STATIC_ROLE_PREFIX).await? {
            let Some(config) = StaticRoleConfig::load(storage, &name).await? else {
                continue;
            };

            let priority = if storage.get(&static_creds_key(&name)).await?.is_some() {
                (now + next_period(&config)).timestamp()
            } else {
                now.timestamp()
            };

            self.shared().queue.push(RotationItem {
                key: name,
                priority,
                value: config,
            });
        }

        tracing::debug!(queued = self.shared().queue.len(), "rehydrated rotation queue");

        if let Err(e) = self.rotate_expired(storage, &CancellationToken::new()).await {
            tracing::warn!(error = %e, "initial static role rotation failed");
        }

        Ok(())
    }
}
