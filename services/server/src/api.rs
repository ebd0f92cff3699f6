use crate::config::ApiConfig;
use crate::error::StoreError;
use crate::event_store::{EventQuery, EventStore, RawMessage};
use crate::ingestion::IngestionPipeline;
use crate::topic_registry::TopicRegistry;
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use relay_pipeline::{Event, EventPatch, NewEvent, ValidationError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn TopicRegistry>,
    pub store: Arc<dyn EventStore>,
    pub pipeline: Arc<IngestionPipeline>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::Storage(_) => {
                error!(error = %self, "Storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, StoreError>;

fn rejected(field: &str, message: String) -> StoreError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message,
    }
    .into()
}

/// JSON request body whose rejections use the API error shape
pub struct JsonBody(pub Value);

#[async_trait]
impl<S> FromRequest<S> for JsonBody
where
    S: Send + Sync,
{
    type Rejection = StoreError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|rejection| rejected("body", rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Query string parameters whose rejections use the API error shape
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = StoreError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(params) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| rejected("query", rejection.body_text()))?;
        Ok(Self(params))
    }
}

/// Subscription response
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// `success` or `failed`
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub subscribed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimestampParams {
    pub timestamp: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/topic", get(list_topics))
        .route("/topic/:topic/subscribe", get(subscribe_topic))
        .route("/topic/:topic/check", get(check_topic))
        .route("/topic/:topic/data", get(topic_data))
        .route("/event", get(list_events).post(create_event))
        .route("/event/topic/:topic", get(events_for_topic))
        .route("/event/id/:id", get(get_event).patch(update_event))
        .route("/event/before", get(events_before))
        .route("/event/after", get(events_after))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "relay-server"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": "connected",
                "pendingTopics": state.pipeline.pending_topics(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "storage": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn list_topics(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    let topics = state.registry.list().await?;
    Ok(Json(topics.into_iter().collect()))
}

#[instrument(skip(state))]
async fn subscribe_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> (StatusCode, Json<SubscribeResponse>) {
    let outcome = state.pipeline.subscribe_to_topic(&topic).await;
    let message = outcome.message(&topic);

    if outcome.is_success() {
        (
            StatusCode::OK,
            Json(SubscribeResponse {
                status: "success".to_string(),
                message,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SubscribeResponse {
                status: "failed".to_string(),
                message,
            }),
        )
    }
}

async fn check_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Json<CheckResponse> {
    Json(CheckResponse {
        subscribed: state.pipeline.is_subscribed(&topic),
    })
}

async fn topic_data(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    QueryParams(params): QueryParams<LimitParams>,
) -> ApiResult<Json<Vec<RawMessage>>> {
    let messages = state.store.raw_messages(&topic, positive(params.limit)).await?;
    Ok(Json(messages))
}

async fn list_events(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<LimitParams>,
) -> ApiResult<Json<Vec<Event>>> {
    query_events(&state, EventQuery::default().with_limit(params.limit)).await
}

async fn events_for_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    QueryParams(params): QueryParams<LimitParams>,
) -> ApiResult<Json<Vec<Event>>> {
    query_events(&state, EventQuery::by_topic(topic).with_limit(params.limit)).await
}

async fn events_before(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<TimestampParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let timestamp = required_timestamp(params.timestamp)?;
    query_events(&state, EventQuery::before(timestamp).with_limit(params.limit)).await
}

async fn events_after(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<TimestampParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let timestamp = required_timestamp(params.timestamp)?;
    query_events(&state, EventQuery::after(timestamp).with_limit(params.limit)).await
}

#[instrument(skip(state))]
async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Event>> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get(id).await?))
}

#[instrument(skip(state, body))]
async fn create_event(
    State(state): State<AppState>,
    JsonBody(body): JsonBody,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let new: NewEvent = serde_json::from_value(body).map_err(|e| ValidationError::InvalidValue {
        field: "body".to_string(),
        message: e.to_string(),
    })?;
    let event = state.store.create(new).await?;

    info!(event_id = %event.id, topic = %event.topic, category = %event.category, "Event created");

    Ok((StatusCode::CREATED, Json(event)))
}

#[instrument(skip(state, body))]
async fn update_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody,
) -> ApiResult<Json<Event>> {
    let id = parse_id(&id)?;
    let patch = EventPatch::from_json(body)?;
    let event = state.store.update(id, &patch).await?;
    Ok(Json(event))
}

async fn query_events(state: &AppState, query: EventQuery) -> ApiResult<Json<Vec<Event>>> {
    Ok(Json(state.store.query(&query).await?))
}

fn parse_id(raw: &str) -> Result<Uuid, ValidationError> {
    raw.parse().map_err(|_| ValidationError::InvalidValue {
        field: "id".to_string(),
        message: format!("{} is not a valid event id", raw),
    })
}

fn required_timestamp(timestamp: Option<DateTime<Utc>>) -> Result<DateTime<Utc>, ValidationError> {
    timestamp.ok_or_else(|| ValidationError::MissingField("timestamp".to_string()))
}

fn positive(limit: Option<i64>) -> Option<i64> {
    limit.filter(|l| *l > 0)
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting relay API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
