//! Thin HTTP layer over the tenant manager and read service.
//!
//! Routes:
//!
//! - `POST /tenants`: create a tenant (201)
//! - `DELETE /tenants/{id}`: delete a tenant (204)
//! - `PUT /tenants/{id}/config/concurrency`: resize its worker pool (200)
//! - `GET /messages?cursor=&limit=`: cursor-paginated reads (200)
//! - `GET /health`: store/broker connectivity probe
//!
//! All errors map to a status code and a `{"error": ...}` body; no stack
//! traces cross the wire.

use crate::broker::Broker;
use crate::manager::{TenantError, TenantManager};
use crate::message::Tenant;
use crate::read::{MessagePage, ReadError, ReadService};
use crate::store::Store;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TenantManager>,
    pub reads: ReadService,
    pub store: Arc<Store>,
    pub broker: Arc<Broker>,
    pub api_key: Option<String>,
}

/// Build the application router with auth applied to everything but
/// `/health`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tenants", post(create_tenant))
        .route("/tenants/{id}", delete(delete_tenant))
        .route("/tenants/{id}/config/concurrency", put(update_concurrency))
        .route("/messages", get(list_messages))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .with_state(state)
}

/// An error kind plus a short human-readable message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        let status = match &err {
            TenantError::AlreadyExists(_) => StatusCode::CONFLICT,
            TenantError::NotFound(_) => StatusCode::NOT_FOUND,
            TenantError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            TenantError::Store(_) | TenantError::Broker(_) => {
                error!(error = %err, "Tenant lifecycle error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ReadError> for ApiError {
    fn from(err: ReadError) -> Self {
        let status = match &err {
            ReadError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            ReadError::Store(_) => {
                error!(error = %err, "Message read error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, Response> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = &state.api_key else {
        // No key configured: auth disabled (dev mode)
        return Ok(next.run(req).await);
    };

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match bearer {
        Some(token) if token == expected => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API key attempt");
            Err(unauthorized())
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(unauthorized())
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid or missing bearer token" })),
    )
        .into_response()
}

fn parse_tenant_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("invalid tenant id: {raw:?}")))
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,

    /// Optional caller-supplied id; generated when absent
    #[serde(default)]
    pub id: Option<Uuid>,
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }

    let tenant = state.manager.create_tenant(req.id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let tenant_id = parse_tenant_id(&id)?;
    state.manager.delete_tenant(tenant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub workers: usize,
}

async fn update_concurrency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConcurrencyRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant_id = parse_tenant_id(&id)?;
    state.manager.update_workers(tenant_id, req.workers).await?;
    Ok(Json(json!({ "id": tenant_id, "workers": req.workers })))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .reads
        .page(query.cursor.as_deref(), query.limit)
        .await?;
    Ok(Json(page))
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.store.ping().await.map_err(|e| {
        error!(error = %e, "Health check: store unreachable");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "store unreachable".to_string(),
        }
    })?;

    if !state.broker.is_connected() {
        error!("Health check: broker disconnected");
        return Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "broker disconnected".to_string(),
        });
    }

    Ok(Json(json!({
        "status": "ok",
        "store": "connected",
        "broker": "connected",
        "tenants": state.manager.tenant_count().await,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_tenant_error_mapping() {
        let id = Uuid::nil();

        let err = ApiError::from(TenantError::AlreadyExists(id));
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = ApiError::from(TenantError::NotFound(id));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = ApiError::from(TenantError::InvalidConfig {
            workers: 0,
            max: 32,
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = ApiError::from(TenantError::Store(StoreError::Unavailable(
            "down".to_string(),
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_read_error_mapping() {
        let err = ApiError::from(ReadError::InvalidCursor("nope".to_string()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("nope"));

        let err = ApiError::from(ReadError::Store(StoreError::Unavailable(
            "down".to_string(),
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_tenant_id() {
        assert!(parse_tenant_id("11111111-1111-1111-1111-111111111111").is_ok());
        assert!(parse_tenant_id("not-a-uuid").is_err());
        assert_eq!(
            parse_tenant_id("nope").unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }
}
