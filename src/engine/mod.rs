//! The IAM secrets engine.
//!
//! Issues dynamic IAM users and STS tokens bound to named roles, and rotates
//! the access keys of long-lived users registered as static roles. All
//! persistent state lives in the request's storage view; the only in-process
//! state is the rotation queue and the cached cloud clients.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::TimeDelta;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{
    error::Error,
    framework::{
        backend::{InitializeFunc, InvalidateFunc, DEFAULT_ROLLBACK_MIN_AGE},
        Backend, PeriodicFunc, Request, Secret, StaticSystemView, SystemView, WalRollbackFunc,
    },
    iam::{IamClient, StsClient},
    storage::Storage,
    utils::{Clock, SystemClock},
};

pub mod client;
pub mod config_lease;
pub mod config_root;
pub mod policy;
pub mod queue;
pub mod roles;
pub mod rotation;
pub mod static_roles;
pub mod template;
pub mod user;

pub use client::{AwsClientFactory, ClientFactory, StaticClientFactory};
pub use config_root::RootConfig;
pub use queue::{RotationItem, RotationQueue};
pub use static_roles::StaticRoleConfig;

/// Regex fragment matching a role name into the `name` capture.
pub(crate) const NAME_PATTERN: &str = r"(?P<name>\w(([\w.-]+)?\w)?)";

const BACKEND_HELP: &str = "\
The IAM secrets engine generates IAM access keys and STS credentials on
demand for named roles, and rotates the keys of existing IAM users
registered as static roles.

Configure root credentials with config/root, define roles under roles/,
then read creds/<role> or sts/<role>.";

#[derive(bon::Builder)]
pub struct BackendConfig {
    #[builder(default = Arc::new(StaticSystemView::default()))]
    pub system: Arc<dyn SystemView>,
    #[builder(default = Arc::new(SystemClock))]
    pub clock: Arc<dyn Clock>,
    #[builder(default = Arc::new(AwsClientFactory))]
    pub client_factory: Arc<dyn ClientFactory>,
    #[builder(default = DEFAULT_ROLLBACK_MIN_AGE)]
    pub rollback_min_age: TimeDelta,
    #[builder(default = TimeDelta::minutes(1))]
    pub min_rotation_period: TimeDelta,
    pub max_rotation_period: Option<TimeDelta>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Default)]
struct Shared {
    queue: RotationQueue,
    iam: Option<Arc<dyn IamClient>>,
    sts: Option<Arc<dyn StsClient>>,
}

pub struct IamBackend {
    config: BackendConfig,
    shared: Mutex<Shared>,
}

impl IamBackend {
    pub fn new(config: BackendConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            shared: Mutex::default(),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.config.clock
    }

    pub fn system(&self) -> &Arc<dyn SystemView> {
        &self.config.system
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cached IAM client, built from the stored root config on first use.
    pub(crate) async fn iam_client(
        &self,
        storage: &dyn Storage,
    ) -> Result<Arc<dyn IamClient>, Error> {
        let cached = self.shared().iam.clone();
        if let Some(client) = cached {
            return Ok(client);
        }

        let config = RootConfig::load(storage).await?;
        let client = self.config.client_factory.iam(config.as_ref()).await?;

        Ok(self.shared().iam.get_or_insert(client).clone())
    }

    pub(crate) async fn sts_client(
        &self,
        storage: &dyn Storage,
    ) -> Result<Arc<dyn StsClient>, Error> {
        let cached = self.shared().sts.clone();
        if let Some(client) = cached {
            return Ok(client);
        }

        let config = RootConfig::load(storage).await?;
        let client = self.config.client_factory.sts(config.as_ref()).await?;

        Ok(self.shared().sts.get_or_insert(client).clone())
    }

    /// Drops the cached clients so the next call rebuilds them from storage.
    pub(crate) fn reset_clients(&self) {
        let mut shared = self.shared();
        shared.iam = None;
        shared.sts = None;
    }

    /// A snapshot of the rotation queue in drain order.
    pub fn queued_rotations(&self) -> Vec<RotationItem> {
        self.shared().queue.snapshot()
    }

    /// Assembles the routable backend.
    pub fn backend(self: &Arc<Self>) -> Backend {
        let mut paths = Vec::new();
        paths.extend(config_root::paths(self));
        paths.extend(config_lease::paths(self));
        paths.extend(roles::paths(self));
        paths.extend(user::paths(self));
        paths.extend(static_roles::paths(self));

        let secrets: Vec<Secret> = vec![user::access_keys_secret(self), user::sts_secret(self)];

        let user_rollback: WalRollbackFunc = {
            let this = self.clone();
            Arc::new(
                move |req: Request, _kind: String, data: Value| -> BoxFuture<'static, Result<(), Error>> {
                    let this = this.clone();
                    Box::pin(async move { this.user_rollback(req, data).await })
                },
            )
        };

        let periodic: PeriodicFunc = {
            let this = self.clone();
            Arc::new(move |req: Request| -> BoxFuture<'static, Result<(), Error>> {
                let this = this.clone();
                Box::pin(async move { this.rotate_expired(&*req.storage, &req.cancel).await })
            })
        };

        let initialize: InitializeFunc = {
            let this = self.clone();
            Arc::new(move |storage: Arc<dyn Storage>| -> BoxFuture<'static, Result<(), Error>> {
                let this = this.clone();
                Box::pin(async move { this.rehydrate_queue(&*storage).await })
            })
        };

        let invalidate: InvalidateFunc = {
            let this = self.clone();
            Arc::new(move |key: &str| {
                if key == config_root::ROOT_CONFIG_KEY {
                    this.reset_clients();
                }
            })
        };

        Backend::builder()
            .help(BACKEND_HELP)
            .paths(paths)
            .secrets(secrets)
            .wal_rollback(HashMap::from([(
                user::USER_WAL_KIND.to_owned(),
                user_rollback,
            )]))
            .wal_rollback_min_age(self.config.rollback_min_age)
            .periodic(periodic)
            .initialize(initialize)
            .invalidate(invalidate)
            .system(self.config.system.clone())
            .clock(self.config.clock.clone())
            .build()
    }
}

/// Builds the IAM backend from `config`.
pub fn factory(config: BackendConfig) -> Backend {
    IamBackend::new(config).backend()
}
