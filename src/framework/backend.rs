//! Request routing and dispatch shared by every backend.

use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Arc, OnceLock},
};

use chrono::TimeDelta;
use futures_util::future::BoxFuture;
use itertools::Itertools;
use regex::Regex;
use serde_json::Value;

use crate::{
    error::Error,
    storage::Storage,
    utils::{Clock, SystemClock},
};

use super::{
    field::{unknown_fields, FieldData},
    path::{anchored, Path},
    request::{Operation, Request},
    response::Response,
    secret::Secret,
    system::{ReplicationState, StaticSystemView, SystemView},
    wal,
};

pub const DEFAULT_ROLLBACK_MIN_AGE: TimeDelta = TimeDelta::minutes(10);

/// Undoes the side effects recorded by one WAL entry. Receives the entry kind and data.
pub type WalRollbackFunc =
    Arc<dyn Fn(Request, String, Value) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Runs on every rollback request, before the WAL scan.
pub type PeriodicFunc = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

pub type InitializeFunc =
    Arc<dyn Fn(Arc<dyn Storage>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

pub type InvalidateFunc = Arc<dyn Fn(&str) + Send + Sync>;

struct Compiled {
    patterns: Vec<Regex>,
}

#[derive(bon::Builder)]
pub struct Backend {
    #[builder(into, default)]
    help: String,
    #[builder(default)]
    paths: Vec<Path>,
    #[builder(default)]
    secrets: Vec<Secret>,
    #[builder(default)]
    wal_rollback: HashMap<String, WalRollbackFunc>,
    #[builder(default = DEFAULT_ROLLBACK_MIN_AGE)]
    wal_rollback_min_age: TimeDelta,
    periodic: Option<PeriodicFunc>,
    initialize: Option<InitializeFunc>,
    invalidate: Option<InvalidateFunc>,
    #[builder(default = Arc::new(StaticSystemView::default()))]
    system: Arc<dyn SystemView>,
    #[builder(default = Arc::new(SystemClock))]
    clock: Arc<dyn Clock>,
    #[builder(skip)]
    compiled: OnceLock<Result<Compiled, String>>,
}

impl Backend {
    pub fn system(&self) -> &Arc<dyn SystemView> {
        &self.system
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn secret(&self, kind: &str) -> Option<&Secret> {
        self.secrets.iter().find(|s| s.kind == kind)
    }

    fn compile(&self) -> Result<Compiled, String> {
        let mut patterns = Vec::with_capacity(self.paths.len());

        for path in &self.paths {
            if path.operations.contains_key(&Operation::Create) && path.existence_check.is_none() {
                return Err(format!(
                    "path {:?} declares a create operation without an existence check",
                    path.pattern
                ));
            }

            let re = Regex::new(&anchored(&path.pattern))
                .map_err(|e| format!("invalid path pattern {:?}: {e}", path.pattern))?;
            patterns.push(re);
        }

        Ok(Compiled { patterns })
    }

    fn compiled(&self) -> Result<&Compiled, Error> {
        self.compiled
            .get_or_init(|| self.compile())
            .as_ref()
            .map_err(|e| Error::internal(eyre::eyre!("{e}")))
    }

    /// Finds the first declared path matching `path`, with its named captures.
    pub fn route(&self, path: &str) -> Result<Option<(&Path, HashMap<String, String>)>, Error> {
        let compiled = self.compiled()?;

        for (re, p) in compiled.patterns.iter().zip(&self.paths) {
            let Some(caps) = re.captures(path) else {
                continue;
            };

            let captures = re
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_owned(), m.as_str().to_owned())))
                .collect();

            return Ok(Some((p, captures)));
        }

        Ok(None)
    }

    /// Merges URL captures over the request body. Captured values win.
    fn field_data(
        path: &Path,
        req: &Request,
        captures: HashMap<String, String>,
    ) -> (FieldData, Vec<String>) {
        let mut raw = req.data.clone();
        let mut replaced = Vec::new();

        for (name, value) in captures.into_iter().sorted() {
            if raw.insert(name.clone(), Value::String(value)).is_some() {
                replaced.push(name);
            }
        }

        (FieldData::new(raw, path.fields.clone()), replaced)
    }

    pub async fn handle_request(&self, req: Request) -> Result<Option<Response>, Error> {
        self.compiled()?;

        match req.operation {
            Operation::Renew | Operation::Revoke => return self.handle_revoke_renew(req).await,
            Operation::Rollback => return self.handle_rollback(req).await,
            Operation::Help if req.path.is_empty() => return Ok(Some(self.root_help())),
            _ => {}
        }

        let (path, captures) = self
            .route(&req.path)?
            .ok_or_else(|| Error::unsupported_path(&req.path))?;

        let Some(op) = path.operations.get(&req.operation) else {
            if req.operation == Operation::Help {
                return Ok(Some(self.path_help(path)));
            }
            return Err(Error::unsupported_operation(req.operation));
        };

        let forward = match self.system.replication_state() {
            ReplicationState::Primary => false,
            ReplicationState::PerformanceStandby => op.properties.forward_performance_standby,
            ReplicationState::PerformanceSecondary => op.properties.forward_performance_secondary,
        };
        if forward {
            return Err(Error::ReadOnly);
        }

        let (data, replaced) = Self::field_data(path, &req, captures);

        if let Err(e) = data.validate() {
            return Ok(Some(Response::error(format!("Field validation failed: {e}"))));
        }

        let mut warnings = Vec::new();
        if !path.takes_arbitrary_input {
            let ignored = unknown_fields(data.raw(), data.schema());
            if !ignored.is_empty() {
                warnings.push(format!(
                    "Endpoint ignored these unrecognized parameters: {ignored:?}"
                ));
            }
        }
        if !replaced.is_empty() {
            warnings.push(format!(
                "Endpoint replaced the value of these parameters with the values captured from the endpoint's path: {replaced:?}"
            ));
        }

        let resp = (op.callback)(req, data).await?;

        Ok(match resp {
            Some(mut resp) => {
                resp.warnings.extend(warnings);
                Some(resp)
            }
            None if !warnings.is_empty() => Some(Response {
                warnings,
                ..Default::default()
            }),
            None => None,
        })
    }

    /// Routes `req` and runs the path's existence check.
    ///
    /// Returns `(check_found, exists)`. `check_found` is false when the
    /// route has no existence check.
    pub async fn handle_existence_check(&self, req: Request) -> Result<(bool, bool), Error> {
        let (path, captures) = self
            .route(&req.path)?
            .ok_or_else(|| Error::unsupported_path(&req.path))?;

        let Some(check) = path.existence_check.clone() else {
            return Ok((false, false));
        };

        let (data, _) = Self::field_data(path, &req, captures);
        data.validate()
            .map_err(|e| Error::validation(format!("Field validation failed: {e}")))?;

        Ok((true, check(req, data).await?))
    }

    async fn handle_revoke_renew(&self, req: Request) -> Result<Option<Response>, Error> {
        let lease = req
            .secret
            .as_ref()
            .ok_or_else(|| Error::validation("request has no secret"))?;

        let kind = lease
            .secret_type()
            .ok_or_else(|| Error::validation("secret is missing internal type information"))?;

        let secret = self
            .secret(kind)
            .ok_or_else(|| Error::unsupported_operation(req.operation))?;

        let callback = match req.operation {
            Operation::Renew => secret.renew.clone(),
            Operation::Revoke => secret.revoke.clone(),
            other => return Err(Error::unsupported_operation(other)),
        }
        .ok_or_else(|| Error::unsupported_operation(req.operation))?;

        let data = FieldData::new(req.data.clone(), secret.fields.clone());

        callback(req, data).await
    }

    async fn handle_rollback(&self, req: Request) -> Result<Option<Response>, Error> {
        let mut errors = Vec::new();

        if let Some(periodic) = &self.periodic {
            if let Err(e) = periodic(req.clone()).await {
                errors.push(e);
            }
        }

        if !self.wal_rollback.is_empty() {
            if let Err(e) = self.handle_wal_rollback(&req).await {
                errors.push(e);
            }
        }

        Error::from_many(errors)?;

        Ok(None)
    }

    async fn handle_wal_rollback(&self, req: &Request) -> Result<(), Error> {
        let storage = &*req.storage;
        let ids = wal::list(storage).await?;
        if ids.is_empty() {
            return Ok(());
        }

        let min_age = if req.data.contains_key("immediate") {
            TimeDelta::zero()
        } else {
            self.wal_rollback_min_age
        };
        let now = self.clock.now();

        let mut errors = Vec::new();
        for id in ids {
            if req.cancel.is_cancelled() {
                errors.push(Error::Cancelled);
                break;
            }

            let entry = match wal::get(storage, &id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            if entry.age(now) < min_age {
                continue;
            }

            let Some(rollback) = self.wal_rollback.get(&entry.kind) else {
                errors.push(Error::internal(eyre::eyre!(
                    "no rollback handler for WAL kind {:?}",
                    entry.kind
                )));
                continue;
            };

            match rollback(req.clone(), entry.kind.clone(), entry.data).await {
                Ok(()) => {
                    tracing::info!(wal_id = %id, kind = %entry.kind, "rolled back WAL entry");
                    if let Err(e) = wal::delete(storage, &id).await {
                        errors.push(e);
                    }
                }
                Err(e) => errors.push(Error::CrashRecoveryPending {
                    wal_id: id,
                    kind: entry.kind,
                    source: Box::new(e),
                }),
            }
        }

        Error::from_many(errors)
    }

    pub async fn initialize(&self, storage: Arc<dyn Storage>) -> Result<(), Error> {
        self.compiled()?;

        match &self.initialize {
            Some(init) => init(storage).await,
            None => Ok(()),
        }
    }

    /// Notifies the backend that `key` changed underneath it.
    pub fn invalidate_key(&self, key: &str) {
        if let Some(invalidate) = &self.invalidate {
            invalidate(key);
        }
    }

    fn root_help(&self) -> Response {
        let mut text = String::new();
        let _ = writeln!(text, "## DESCRIPTION\n\n{}\n\n## PATHS\n", self.help.trim());

        for path in self.paths.iter().sorted_by(|a, b| a.pattern.cmp(&b.pattern)) {
            let _ = writeln!(text, "    {}\n        {}\n", path.pattern, path.help_synopsis.trim());
        }

        Response::help(text)
    }

    fn path_help(&self, path: &Path) -> Response {
        let mut text = String::new();
        let _ = writeln!(text, "Request:        {}", path.pattern);
        let _ = writeln!(text, "\n{}", path.help_synopsis.trim());

        if !path.fields.is_empty() {
            let _ = writeln!(text, "\n## PARAMETERS\n");
            for (name, field) in path.fields.iter() {
                let _ = writeln!(text, "    {name} ({})\n        {}\n", field.ty, field.description.trim());
            }
        }

        if !path.help_description.is_empty() {
            let _ = writeln!(text, "## DESCRIPTION\n\n{}", path.help_description.trim());
        }

        Response::help(text)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::{
        framework::{
            field::{fields, FieldSchema, FieldType},
            path::{existence, handler, PathOperation},
        },
        storage::memory::InMemoryStorage,
        utils::ManualClock,
    };

    use super::*;

    async fn echo(_: Arc<()>, _: Request, data: FieldData) -> Result<Option<Response>, Error> {
        Ok(Some(Response::with_data(data.raw().clone())))
    }

    async fn exists(_: Arc<()>, _: Request, _: FieldData) -> Result<bool, Error> {
        Ok(true)
    }

    fn storage() -> Arc<dyn Storage> {
        Arc::new(InMemoryStorage::new())
    }

    fn test_backend() -> Backend {
        let target = Arc::new(());
        Backend::builder()
            .help("test backend")
            .paths(vec![
                Path::new("roles/?$")
                    .operation(Operation::List, handler(&target, echo))
                    .help("List roles", ""),
                Path::new("roles/(?P<name>[^/]+)")
                    .fields(fields([
                        ("name", FieldSchema::new(FieldType::NameString, "Role name")),
                        ("ttl", FieldSchema::new(FieldType::DurationSeconds, "TTL")),
                    ]))
                    .operation(Operation::Read, handler(&target, echo))
                    .operation(Operation::Create, handler(&target, echo))
                    .operation(
                        Operation::Update,
                        PathOperation::new(handler(&target, echo)).forward_to_primary(),
                    )
                    .existence_check(existence(&target, exists))
                    .help("Manage roles", "Roles map names to policies."),
            ])
            .build()
    }

    #[tokio::test]
    async fn test_routes_and_merges_captures() {
        let backend = test_backend();

        let req = Request::new(Operation::Read, "roles/deploy", storage())
            .with_data(json!({ "name": "other", "ttl": "1h" }));
        let resp = backend.handle_request(req).await.unwrap().unwrap();

        assert_eq!(resp.get("name"), Some(&json!("deploy")));
        assert_eq!(resp.warnings.len(), 1);
        assert!(resp.warnings[0].contains("replaced"));
    }

    #[tokio::test]
    async fn test_unknown_fields_warn() {
        let backend = test_backend();

        let req = Request::new(Operation::Read, "roles/deploy", storage())
            .with_data(json!({ "bogus": 1 }));
        let resp = backend.handle_request(req).await.unwrap().unwrap();

        assert_eq!(
            resp.warnings,
            vec![r#"Endpoint ignored these unrecognized parameters: ["bogus"]"#]
        );
    }

    #[tokio::test]
    async fn test_unsupported_path_and_operation() {
        let backend = test_backend();

        let err = backend
            .handle_request(Request::new(Operation::Read, "nope", storage()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPath { .. }));

        let err = backend
            .handle_request(Request::new(Operation::Delete, "roles/deploy", storage()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn test_coercion_error_is_response_error() {
        let backend = test_backend();

        let req = Request::new(Operation::Read, "roles/deploy", storage())
            .with_data(json!({ "ttl": "forever" }));
        let resp = backend.handle_request(req).await.unwrap().unwrap();

        assert!(resp
            .error_message()
            .unwrap()
            .starts_with("Field validation failed"));
    }

    #[tokio::test]
    async fn test_invalid_capture_is_response_error() {
        let backend = test_backend();

        let resp = backend
            .handle_request(Request::new(Operation::Read, "roles/-bad", storage()))
            .await
            .unwrap()
            .unwrap();
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn test_help() {
        let backend = test_backend();

        let root = backend
            .handle_request(Request::new(Operation::Help, "", storage()))
            .await
            .unwrap()
            .unwrap();
        let text = root.get("help").unwrap().as_str().unwrap();
        let item = text.find("roles/(?P<name>").unwrap();
        let list = text.find("roles/?$").unwrap();
        assert!(item < list);

        let path = backend
            .handle_request(Request::new(Operation::Help, "roles/deploy", storage()))
            .await
            .unwrap()
            .unwrap();
        let text = path.get("help").unwrap().as_str().unwrap();
        assert!(text.find("name (name-string)").unwrap() < text.find("ttl (duration-seconds)").unwrap());
        assert!(text.contains("Roles map names to policies."));
    }

    #[tokio::test]
    async fn test_forwarded_operation_is_read_only_on_standby() {
        let target = Arc::new(());
        let backend = Backend::builder()
            .paths(vec![Path::new("config")
                .operation(
                    Operation::Update,
                    PathOperation::new(handler(&target, echo)).forward_to_primary(),
                )
                .operation(Operation::Read, handler(&target, echo))])
            .system(Arc::new(
                StaticSystemView::builder()
                    .replication_state(ReplicationState::PerformanceStandby)
                    .build(),
            ))
            .build();

        let err = backend
            .handle_request(Request::new(Operation::Update, "config", storage()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly));

        assert!(backend
            .handle_request(Request::new(Operation::Read, "config", storage()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_create_without_existence_check_is_rejected() {
        let target = Arc::new(());
        let backend = Backend::builder()
            .paths(vec![Path::new("things").operation(Operation::Create, handler(&target, echo))])
            .build();

        let err = backend
            .handle_request(Request::new(Operation::Create, "things", storage()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InternalServerError { .. }));
    }

    #[tokio::test]
    async fn test_existence_check() {
        let backend = test_backend();

        let (found, exists) = backend
            .handle_existence_check(Request::new(Operation::Create, "roles/deploy", storage()))
            .await
            .unwrap();
        assert!(found && exists);

        let (found, _) = backend
            .handle_existence_check(Request::new(Operation::List, "roles/", storage()))
            .await
            .unwrap();
        assert!(!found);
    }

    fn counting_backend(
        calls: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
        fail: bool,
    ) -> Backend {
        let rollback: WalRollbackFunc = Arc::new(move |_req: Request, kind: String, data: Value| {
            let calls = calls.clone();
            Box::pin(async move {
                assert_eq!(kind, "user");
                assert_eq!(data["username"], "u");
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(Error::validation("cloud is down"));
                }
                Ok(())
            })
        });

        Backend::builder()
            .wal_rollback(HashMap::from([("user".to_owned(), rollback)]))
            .clock(clock)
            .build()
    }

    fn start() -> DateTime<chrono::Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_rollback_respects_min_age() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(start()));
        let backend = counting_backend(calls.clone(), clock.clone(), false);
        let storage = storage();

        wal::put(&*storage, "user", &json!({ "username": "u" }), start())
            .await
            .unwrap();

        clock.advance(TimeDelta::minutes(5));
        backend
            .handle_request(Request::new(Operation::Rollback, "", storage.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(wal::list(&*storage).await.unwrap().len(), 1);

        clock.advance(TimeDelta::minutes(10));
        backend
            .handle_request(Request::new(Operation::Rollback, "", storage.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(wal::list(&*storage).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_rollback_ignores_min_age() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(start()));
        let backend = counting_backend(calls.clone(), clock, false);
        let storage = storage();

        wal::put(&*storage, "user", &json!({ "username": "u" }), start())
            .await
            .unwrap();

        backend
            .handle_request(
                Request::new(Operation::Rollback, "", storage.clone())
                    .with_data(json!({ "immediate": true })),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(wal::list(&*storage).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_entries_and_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(start() + TimeDelta::hours(1)));
        let backend = counting_backend(calls.clone(), clock, true);
        let storage = storage();

        for _ in 0..2 {
            wal::put(&*storage, "user", &json!({ "username": "u" }), start())
                .await
                .unwrap();
        }

        let err = backend
            .handle_request(Request::new(Operation::Rollback, "", storage.clone()))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::Multiple { ref errors } if errors.len() == 2));
        assert_eq!(wal::list(&*storage).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_periodic_runs_on_rollback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let periodic: PeriodicFunc = {
            let calls = calls.clone();
            Arc::new(move |_req: Request| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        let backend = Backend::builder().periodic(periodic).build();
        backend
            .handle_request(Request::new(Operation::Rollback, "", storage()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoke_without_secret_type() {
        let backend = test_backend();
        let req = Request::new(Operation::Revoke, "", storage())
            .with_secret(Default::default());

        let err = backend.handle_request(req).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    proptest! {
        #[test]
        fn prop_routing_is_first_match(
            segments in proptest::collection::vec("[a-c]{1,3}", 1..4),
        ) {
            let target = Arc::new(());
            let backend = Backend::builder()
                .paths(vec![
                    Path::new("a.*").operation(Operation::Read, handler(&target, echo)),
                    Path::new("(?P<any>.*)").operation(Operation::Read, handler(&target, echo)),
                    Path::new("b.*").operation(Operation::Read, handler(&target, echo)),
                ])
                .build();

            let path = segments.join("/");
            let first = backend.route(&path).unwrap().map(|(p, _)| p.pattern.clone());
            let second = backend.route(&path).unwrap().map(|(p, _)| p.pattern.clone());
            prop_assert_eq!(&first, &second);

            let expected = if path.starts_with('a') { "a.*" } else { "(?P<any>.*)" };
            prop_assert_eq!(first.as_deref(), Some(expected));
        }
    }
}
