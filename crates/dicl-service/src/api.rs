//! REST API
//!
//! Thin axum layer over [`DiclService`]. Handlers parse, call one service
//! operation and map the outcome to a status code.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use dicl_common::{DiclError, ExampleId, VERSION};

use crate::config::PopulationJob;
use crate::domain::example::{Example, Input, PartitionKey, ScoredExample};
use crate::domain::executor::{InferenceStage, StageError};
use crate::domain::population::PopulationReport;
use crate::infra::example_store::PartitionStats;
use crate::infra::feedback::FeedbackRequest;
use crate::service::{DiclService, InferenceRequest, InferenceResponse};
use crate::SERVICE_NAME;

/// Error returned by a handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    stage: Option<InferenceStage>,
}

impl ApiError {
    fn status_for(error: &DiclError) -> StatusCode {
        match error {
            DiclError::NotFound(_) => StatusCode::NOT_FOUND,
            DiclError::DimensionMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DiclError::Config(_) | DiclError::Serialization(_) | DiclError::StoreWrite(_) => {
                StatusCode::BAD_REQUEST
            }
            DiclError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_retriable() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DiclError> for ApiError {
    fn from(error: DiclError) -> Self {
        Self {
            status: Self::status_for(&error),
            message: error.to_string(),
            stage: None,
        }
    }
}

impl From<StageError> for ApiError {
    fn from(error: StageError) -> Self {
        Self {
            status: Self::status_for(&error.source),
            message: error.to_string(),
            stage: Some(error.stage),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "API error");
        } else {
            tracing::warn!(status = %self.status, error = %self.message, "API error");
        }

        let mut body = json!({ "error": self.message });
        if let Some(stage) = self.stage {
            body["stage"] = json!(stage);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of `POST /retrieve`
#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub function_name: String,
    pub variant_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub input: Input,
    #[serde(default)]
    pub k: Option<usize>,
}

/// A retrieved example without its embedding
#[derive(Debug, Serialize)]
pub struct RetrievedExample {
    pub id: ExampleId,
    pub input: String,
    pub output: String,
    pub similarity: f32,
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_inference_id: Option<Uuid>,
}

impl From<ScoredExample> for RetrievedExample {
    fn from(scored: ScoredExample) -> Self {
        Self {
            id: scored.example.id,
            input: scored.example.input,
            output: scored.example.output,
            similarity: scored.similarity,
            rank: scored.rank,
            source_inference_id: scored.example.source_inference_id,
        }
    }
}

/// Body of `POST /examples`
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub function_name: String,
    pub variant_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub input: Input,
    /// Text for chat functions, any JSON value for JSON functions
    pub output: Value,
}

/// Build the router over a shared service
pub fn router(service: Arc<DiclService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/version", get(version))
        .route("/inference", post(inference))
        .route("/feedback", post(feedback))
        .route("/retrieve", post(retrieve))
        .route("/examples", post(ingest_example))
        .route("/examples/batch", post(upsert_examples))
        .route("/populate", post(populate))
        .route(
            "/partitions/:function_name/:variant_name/:namespace/stats",
            get(partition_stats),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn version() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": VERSION,
        "description": "Dynamic in-context learning inference variants",
    }))
}

async fn inference(
    State(service): State<Arc<DiclService>>,
    Json(request): Json<InferenceRequest>,
) -> ApiResult<Json<InferenceResponse>> {
    Ok(Json(service.infer(request).await?))
}

async fn feedback(
    State(service): State<Arc<DiclService>>,
    Json(request): Json<FeedbackRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    service.feedback(request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))))
}

async fn retrieve(
    State(service): State<Arc<DiclService>>,
    Json(request): Json<RetrieveRequest>,
) -> ApiResult<Json<Value>> {
    let results = service
        .retrieve(
            &request.function_name,
            &request.variant_name,
            request.namespace.as_deref(),
            &request.input,
            request.k,
        )
        .await?;
    let examples: Vec<RetrievedExample> = results.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "examples": examples })))
}

async fn ingest_example(
    State(service): State<Arc<DiclService>>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let example = service
        .ingest_demonstration(
            &request.function_name,
            &request.variant_name,
            request.namespace.as_deref(),
            &request.input,
            &request.output,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": example.id,
            "partition": example.partition(),
        })),
    ))
}

/// Write already-embedded examples as one atomic batch
async fn upsert_examples(
    State(service): State<Arc<DiclService>>,
    Json(examples): Json<Vec<Example>>,
) -> ApiResult<Json<Value>> {
    let inserted = service.upsert(examples).await?;
    Ok(Json(json!({ "inserted": inserted })))
}

async fn populate(
    State(service): State<Arc<DiclService>>,
    Json(job): Json<PopulationJob>,
) -> ApiResult<Json<PopulationReport>> {
    Ok(Json(service.populate(&job).await?))
}

async fn partition_stats(
    State(service): State<Arc<DiclService>>,
    Path((function_name, variant_name, namespace)): Path<(String, String, String)>,
) -> ApiResult<Json<PartitionStats>> {
    let partition = PartitionKey::new(function_name, variant_name, namespace);
    Ok(Json(service.partition_stats(&partition).await?))
}
