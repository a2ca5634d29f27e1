//! Development HTTP front end.
//!
//! Maps `/v1/<path>` onto backend requests so the engine can be driven with
//! curl. There is no authentication and no lease bookkeeping: renew and
//! revoke go through `/v1/sys/leases/{renew,revoke}` with the lease's
//! `internal_data` echoed back in the body.

use std::sync::Arc;

use actix_web::{
    http::Method,
    web::{self, Bytes, Data},
    HttpRequest, HttpResponse, Scope,
};
use chrono::TimeDelta;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    framework::{Backend, Operation, Request, Response, SecretLease},
    storage::Storage,
};

const DISPLAY_NAME: &str = "dev";

pub struct AppState {
    pub backend: Arc<Backend>,
    pub storage: Arc<dyn Storage>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    list: bool,
}

/// Body of a lease renew or revoke call.
#[derive(Debug, Deserialize)]
struct LeaseBody {
    #[serde(default)]
    internal_data: Map<String, Value>,
    #[serde(default)]
    increment: i64,
    issue_time: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn service() -> Scope {
    web::scope("/v1")
        .route("/sys/leases/renew", web::put().to(lease_renew))
        .route("/sys/leases/revoke", web::put().to(lease_revoke))
        .route("/{path:.*}", web::route().to(dispatch))
}

fn parse_body(body: &Bytes) -> Result<Value, Error> {
    if body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body).map_err(|e| Error::validation(format!("invalid JSON body: {e}")))
}

fn render(resp: Option<Response>) -> HttpResponse {
    let Some(resp) = resp else {
        return HttpResponse::NoContent().finish();
    };

    if let Some(message) = resp.error_message() {
        return HttpResponse::BadRequest().json(json!({ "errors": [message] }));
    }

    let lease = resp.secret.as_ref().map(|s| {
        json!({
            "lease_duration": s.ttl.num_seconds(),
            "renewable": s.renewable,
            "internal_data": s.internal_data,
        })
    });

    HttpResponse::Ok().json(json!({
        "data": resp.data,
        "lease": lease,
        "warnings": resp.warnings,
    }))
}

async fn dispatch(
    state: Data<AppState>,
    http: HttpRequest,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
    body: Bytes,
) -> Result<HttpResponse, Error> {
    let path = path.into_inner();
    let data = parse_body(&body)?;

    let request = |operation| {
        Request::new(operation, path.clone(), state.storage.clone())
            .with_data(data.clone())
            .with_display_name(DISPLAY_NAME)
            .with_cancel(state.cancel.child_token())
    };

    let method = http.method();
    let operation = if method == Method::GET {
        if query.list {
            Operation::List
        } else {
            Operation::Read
        }
    } else if method == Method::DELETE {
        Operation::Delete
    } else if method == Method::POST || method == Method::PUT {
        match state.backend.handle_existence_check(request(Operation::Create)).await? {
            (true, false) => Operation::Create,
            _ => Operation::Update,
        }
    } else {
        return Err(Error::unsupported_operation(method));
    };

    tracing::debug!(%path, %operation, "dispatching request");

    Ok(render(state.backend.handle_request(request(operation)).await?))
}

async fn lease_call(state: Data<AppState>, operation: Operation, body: Bytes) -> Result<HttpResponse, Error> {
    let body: LeaseBody = serde_json::from_value(parse_body(&body)?)?;

    let lease = SecretLease {
        increment: TimeDelta::seconds(body.increment),
        issue_time: body.issue_time,
        internal_data: body.internal_data,
        ..Default::default()
    };

    let req = Request::new(operation, "", state.storage.clone())
        .with_secret(lease)
        .with_display_name(DISPLAY_NAME)
        .with_cancel(state.cancel.child_token());

    Ok(render(state.backend.handle_request(req).await?))
}

async fn lease_renew(state: Data<AppState>, body: Bytes) -> Result<HttpResponse, Error> {
    lease_call(state, Operation::Renew, body).await
}

async fn lease_revoke(state: Data<AppState>, body: Bytes) -> Result<HttpResponse, Error> {
    lease_call(state, Operation::Revoke, body).await
}
