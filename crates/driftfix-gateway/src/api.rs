//! Request handlers for the migration trigger.
//!
//! Every response body is `{ "success": bool, "data": ... }`.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use driftfix_common::Error;
use driftfix_migrate::{
    MigrationError, NetworkReport, Notice, RunReport, ScopeProvider, ScopeStatus, collect_notices,
};
use driftfix_security::{Capability, InputValidator, MIGRATE_ACTION, Principal};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::SharedState;

/// Header carrying the action nonce.
pub const NONCE_HEADER: &str = "x-driftfix-nonce";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MigrateRequest {
    pub scope: Option<String>,
    pub network: bool,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Locked(String),
    StepFailed {
        scope: String,
        step: String,
        cause: String,
    },
    /// Some scopes of a network run failed.
    Partial(Value),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Unauthorized(msg) => ApiError::Forbidden(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Security(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MigrationError> for ApiError {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::Locked { scope } => ApiError::Locked(scope),
            MigrationError::StepFailed {
                scope, step, cause, ..
            } => ApiError::StepFailed {
                scope,
                step,
                cause: cause.to_string(),
            },
            MigrationError::Store(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, data) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "message": msg })),
            ApiError::Forbidden(msg) => {
                warn!("request refused: {msg}");
                (StatusCode::FORBIDDEN, Value::Null)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "message": msg })),
            ApiError::Locked(scope) => (
                StatusCode::CONFLICT,
                json!({ "scope": scope, "message": "another migration run holds the lock" }),
            ),
            ApiError::StepFailed { scope, step, cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "scope": scope, "step": step, "cause": cause }),
            ),
            ApiError::Partial(data) => (StatusCode::INTERNAL_SERVER_ERROR, data),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": msg }))
            }
        };
        (status, Json(json!({ "success": false, "data": data }))).into_response()
    }
}

fn success(data: impl Serialize) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// Resolve the bearer token to a configured administrator.
fn principal<'a>(state: &'a SharedState, headers: &HeaderMap) -> Result<&'a Principal, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Forbidden("missing authorization header".into()))?;
    let token = InputValidator::bearer_token(header)?;
    Ok(state.admins.authenticate(token)?)
}

pub async fn health() -> &'static str {
    "ok"
}

/// `GET /api/nonce`: a migrate nonce bound to the caller.
pub async fn issue_nonce(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let admin = principal(&state, &headers)?;
    let nonce = state.nonces.issue(MIGRATE_ACTION, &admin.name);
    Ok(success(json!({ "nonce": nonce })))
}

/// `POST /api/migrate`: both the capability and the nonce must check out.
pub async fn migrate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: MigrateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        MigrateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?
    };
    if request.network && request.scope.is_some() {
        return Err(ApiError::BadRequest(
            "`scope` and `network` cannot be combined".into(),
        ));
    }
    if let Some(scope) = &request.scope {
        InputValidator::validate_scope_id(scope)?;
    }

    let admin = principal(&state, &headers)?;
    let needed = if request.network && state.database.is_multisite() {
        Capability::ManageNetwork
    } else {
        Capability::ManageOptions
    };
    admin.require(needed)?;

    let nonce = headers
        .get(NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Forbidden("missing nonce".into()))?;
    state.nonces.verify(nonce, MIGRATE_ACTION, &admin.name)?;

    info!(
        "migration requested by {} (scope: {:?}, network: {})",
        admin.name, request.scope, request.network
    );

    let worker = state.clone();
    tokio::task::spawn_blocking(move || run_migration(&worker, &request))
        .await
        .map_err(|e| ApiError::Internal(format!("migration task failed: {e}")))?
}

enum Migrated {
    Scope(RunReport),
    Network(NetworkReport),
}

fn run_migration(state: &SharedState, request: &MigrateRequest) -> Result<Response, ApiError> {
    let migrated = if request.network {
        Migrated::Network(state.runner.run_network(&state.database)?)
    } else {
        let scope = match &request.scope {
            Some(id) => state.database.find_scope(id)?,
            None => state.database.scope_for(1),
        };
        let store = state.database.open(&scope)?;
        Migrated::Scope(state.runner.run(&scope, &store)?)
    };

    match migrated {
        Migrated::Scope(report) => Ok(success(report)),
        Migrated::Network(report) => {
            let data = network_json(&report);
            if report.is_success() {
                Ok(success(data))
            } else {
                Err(ApiError::Partial(data))
            }
        }
    }
}

fn network_json(report: &NetworkReport) -> Value {
    let scopes: Vec<Value> = report
        .outcomes
        .iter()
        .map(|outcome| match &outcome.result {
            Ok(run) => json!({ "scope": outcome.scope.id, "success": true, "report": run }),
            Err(e) => {
                let mut failure = json!({
                    "scope": outcome.scope.id,
                    "success": false,
                    "cause": e.to_string(),
                });
                if let MigrationError::StepFailed { step, .. } = e {
                    failure["step"] = json!(step);
                }
                failure
            }
        })
        .collect();
    json!({ "scopes": scopes })
}

#[derive(Debug, Serialize)]
struct StatusBody {
    notices: Vec<Notice>,
    scopes: Vec<ScopeStatus>,
}

/// `GET /api/status`: notices and per-scope status. Never migrates.
pub async fn status(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    principal(&state, &headers)?.require(Capability::ManageOptions)?;

    let worker = state.clone();
    let body = tokio::task::spawn_blocking(move || -> Result<StatusBody, ApiError> {
        let notices = collect_notices(
            &worker.runner,
            &worker.inspect,
            worker.companion_version.as_ref(),
        )?;
        let mut scopes = Vec::new();
        for scope in worker.inspect.scopes()? {
            let store = worker.inspect.open(&scope)?;
            scopes.push(worker.runner.status(&scope, &store)?);
        }
        Ok(StatusBody { notices, scopes })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("status task failed: {e}")))??;

    Ok(success(body))
}
