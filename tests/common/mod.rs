#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use credvault::{
    engine::{BackendConfig, IamBackend, StaticClientFactory},
    error::Error,
    framework::{Backend, Operation, Request, Response, SecretLease, StaticSystemView},
    iam::memory::InMemoryIamClient,
    storage::{memory::InMemoryStorage, Storage},
    utils::ManualClock,
};
use serde_json::{json, Value};

pub const ROOT_USER: &str = "vault-root";

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Engine settings that survive [`Harness::restart`].
#[derive(Clone)]
pub struct Settings {
    pub min_rotation_period: TimeDelta,
    pub system: StaticSystemView,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_rotation_period: TimeDelta::seconds(1),
            system: StaticSystemView::default(),
        }
    }
}

pub struct Harness {
    pub backend: Backend,
    pub engine: Arc<IamBackend>,
    pub storage: Arc<dyn Storage>,
    pub iam: InMemoryIamClient,
    pub clock: Arc<ManualClock>,
    settings: Settings,
}

impl Harness {
    /// A fresh engine over empty storage, initialized, with root config written.
    pub async fn new() -> Self {
        Self::with_settings(Settings::default()).await
    }

    pub async fn with_min_rotation_period(min_rotation_period: TimeDelta) -> Self {
        Self::with_settings(Settings {
            min_rotation_period,
            ..Settings::default()
        })
        .await
    }

    pub async fn with_system_view(system: StaticSystemView) -> Self {
        Self::with_settings(Settings {
            system,
            ..Settings::default()
        })
        .await
    }

    async fn with_settings(settings: Settings) -> Self {
        let iam = InMemoryIamClient::new();
        iam.set_caller(ROOT_USER);

        let harness = Self::over(
            Arc::new(InMemoryStorage::new()),
            iam,
            Arc::new(ManualClock::new(t0())),
            settings,
        )
        .await;

        harness
            .write(
                "config/root",
                json!({
                    "access_key": "AKIAROOT",
                    "secret_key": "rootsecret",
                    "region": "us-east-1",
                }),
            )
            .await
            .unwrap();

        harness
    }

    /// A second engine instance sharing storage, cloud state and clock,
    /// as after a restart.
    pub async fn restart(&self) -> Self {
        Self::over(
            self.storage.clone(),
            self.iam.clone(),
            self.clock.clone(),
            self.settings.clone(),
        )
        .await
    }

    async fn over(
        storage: Arc<dyn Storage>,
        iam: InMemoryIamClient,
        clock: Arc<ManualClock>,
        settings: Settings,
    ) -> Self {
        let engine = IamBackend::new(
            BackendConfig::builder()
                .clock(clock.clone())
                .system(Arc::new(settings.system.clone()))
                .client_factory(Arc::new(StaticClientFactory::new(
                    Arc::new(iam.clone()),
                    Arc::new(iam.clone()),
                )))
                .min_rotation_period(settings.min_rotation_period)
                .build(),
        );
        let backend = engine.backend();
        backend.initialize(storage.clone()).await.unwrap();

        Self {
            backend,
            engine,
            storage,
            iam,
            clock,
            settings,
        }
    }

    pub async fn request(
        &self,
        operation: Operation,
        path: &str,
        data: Value,
    ) -> Result<Option<Response>, Error> {
        self.backend
            .handle_request(
                Request::new(operation, path, self.storage.clone())
                    .with_data(data)
                    .with_display_name("token"),
            )
            .await
    }

    pub async fn read(&self, path: &str) -> Result<Option<Response>, Error> {
        self.request(Operation::Read, path, json!({})).await
    }

    pub async fn write(&self, path: &str, data: Value) -> Result<Option<Response>, Error> {
        self.request(Operation::Update, path, data).await
    }

    pub async fn create(&self, path: &str, data: Value) -> Result<Option<Response>, Error> {
        self.request(Operation::Create, path, data).await
    }

    pub async fn delete(&self, path: &str) -> Result<Option<Response>, Error> {
        self.request(Operation::Delete, path, json!({})).await
    }

    pub async fn list(&self, path: &str) -> Vec<String> {
        let resp = self
            .request(Operation::List, path, json!({}))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_value(resp.get("keys").cloned().unwrap()).unwrap()
    }

    pub async fn rollback(&self) -> Result<Option<Response>, Error> {
        self.request(Operation::Rollback, "", json!({})).await
    }

    pub async fn lease_call(&self, operation: Operation, lease: SecretLease) -> Result<Option<Response>, Error> {
        self.backend
            .handle_request(Request::new(operation, "", self.storage.clone()).with_secret(lease))
            .await
    }

    pub async fn wal_ids(&self) -> Vec<String> {
        credvault::framework::wal::list(&*self.storage).await.unwrap()
    }

    pub fn advance(&self, by: TimeDelta) {
        self.clock.advance(by);
    }

    /// Dynamic users the engine created, excluding the root identity.
    pub fn dynamic_users(&self) -> Vec<String> {
        self.iam
            .user_names()
            .into_iter()
            .filter(|u| u.starts_with("vault-token-"))
            .collect()
    }
}

pub fn string(resp: &Response, key: &str) -> String {
    resp.get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("{key} missing from {resp:?}"))
        .to_owned()
}
