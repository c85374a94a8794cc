use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use consulta_api::{
    AddCategoryRequest, AddDocumentRequest, AdminToken, AnswerStatus, ConsultaApi,
    QueryVolumeStats, SubmitRequest, API_CONTRACT_VERSION,
};
use consulta_core::{
    Answer, Category, Document, DocumentId, GenerationError, Generator, Query, QueryError,
    QueryId, QueryState,
};
use consulta_llm::{HttpCompletionClient, LlmConfig};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

struct ServiceState<G> {
    api: Arc<ConsultaApi<G>>,
    admin_token: Option<String>,
}

impl<G> Clone for ServiceState<G> {
    fn clone(&self) -> Self {
        Self { api: Arc::clone(&self.api), admin_token: self.admin_token.clone() }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SetStateRequest {
    state: QueryState,
}

#[derive(Debug, Clone, Deserialize)]
struct SetDocumentActiveRequest {
    active: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "consulta-service")]
#[command(about = "Local HTTP service for the regulatory Q&A pipeline")]
struct Args {
    #[arg(long, default_value = "./consulta_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Shared secret for /v1/admin routes; falls back to CONSULTA_ADMIN_TOKEN.
    #[arg(long)]
    admin_token: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ServiceErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn service_error(err: QueryError) -> ServiceError {
    let status = match &err {
        QueryError::Validation(_) => StatusCode::BAD_REQUEST,
        QueryError::NotFound(_) => StatusCode::NOT_FOUND,
        QueryError::InvalidState(_) | QueryError::ConcurrentRequest(_) => StatusCode::CONFLICT,
        QueryError::Generation(GenerationError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        QueryError::Generation(_) => StatusCode::BAD_GATEWAY,
        QueryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ServiceError { status, message: err.to_string() }
}

fn unauthorized(message: &str) -> ServiceError {
    ServiceError { status: StatusCode::UNAUTHORIZED, message: message.to_string() }
}

fn authorize<G>(state: &ServiceState<G>, headers: &HeaderMap) -> Result<AdminToken, ServiceError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(unauthorized("admin interface is not configured"));
    };
    let provided = headers.get("x-admin-token").and_then(|value| value.to_str().ok());
    if provided == Some(expected) {
        Ok(AdminToken::new("service-admin"))
    } else {
        Err(unauthorized("missing or invalid admin token"))
    }
}

fn app<G: Generator + 'static>(state: ServiceState<G>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/queries", post(submit_query::<G>))
        .route("/v1/queries/:query_id", get(show_query::<G>))
        .route(
            "/v1/queries/:query_id/answer",
            post(request_answer::<G>).get(show_answer::<G>),
        )
        .route("/v1/admin/queries/:query_id/state", post(set_query_state::<G>))
        .route("/v1/admin/stats", get(admin_stats::<G>))
        .route(
            "/v1/admin/documents",
            post(add_document::<G>).get(list_documents::<G>),
        )
        .route("/v1/admin/documents/:document_id/active", post(set_document_active::<G>))
        .route(
            "/v1/admin/categories",
            post(add_category::<G>).get(list_categories::<G>),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let admin_token =
        args.admin_token.or_else(|| std::env::var("CONSULTA_ADMIN_TOKEN").ok());
    if admin_token.is_none() {
        tracing::warn!("no admin token configured; /v1/admin routes will reject all requests");
    }

    let generator = HttpCompletionClient::new(LlmConfig::from_env()?);
    let state = ServiceState { api: Arc::new(ConsultaApi::new(args.db, generator)), admin_token };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "consulta service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn submit_query<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<ServiceEnvelope<Query>>, ServiceError> {
    let query = state.api.submit(request).map_err(service_error)?;
    Ok(Json(envelope(query)))
}

async fn show_query<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    Path(query_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Query>>, ServiceError> {
    let id = QueryId::parse(&query_id).map_err(service_error)?;
    let query = state.api.get_query(id).map_err(service_error)?;
    Ok(Json(envelope(query)))
}

/// Generation runs on the blocking pool so the query still resolves to
/// `answered` or `failed` even if the HTTP caller disconnects mid-call.
async fn request_answer<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    Path(query_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Answer>>, ServiceError> {
    let id = QueryId::parse(&query_id).map_err(service_error)?;
    let api = Arc::clone(&state.api);
    let answer = tokio::task::spawn_blocking(move || api.request_answer(id))
        .await
        .map_err(|err| ServiceError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("generation task failed: {err}"),
        })?
        .map_err(service_error)?;
    Ok(Json(envelope(answer)))
}

async fn show_answer<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    Path(query_id): Path<String>,
) -> Result<Json<ServiceEnvelope<AnswerStatus>>, ServiceError> {
    let id = QueryId::parse(&query_id).map_err(service_error)?;
    let status = state.api.answer_status(id).map_err(service_error)?;
    Ok(Json(envelope(status)))
}

async fn set_query_state<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    Path(query_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SetStateRequest>,
) -> Result<Json<ServiceEnvelope<Query>>, ServiceError> {
    let token = authorize(&state, &headers)?;
    let id = QueryId::parse(&query_id).map_err(service_error)?;
    let query = state.api.set_state(&token, id, request.state).map_err(service_error)?;
    Ok(Json(envelope(query)))
}

async fn admin_stats<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<QueryVolumeStats>>, ServiceError> {
    authorize(&state, &headers)?;
    let stats = state.api.volume_stats().map_err(service_error)?;
    Ok(Json(envelope(stats)))
}

async fn add_document<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    headers: HeaderMap,
    Json(request): Json<AddDocumentRequest>,
) -> Result<Json<ServiceEnvelope<Document>>, ServiceError> {
    let token = authorize(&state, &headers)?;
    let document = state.api.add_document(&token, request).map_err(service_error)?;
    Ok(Json(envelope(document)))
}

async fn list_documents<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Document>>>, ServiceError> {
    authorize(&state, &headers)?;
    let documents = state.api.list_documents().map_err(service_error)?;
    Ok(Json(envelope(documents)))
}

async fn set_document_active<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SetDocumentActiveRequest>,
) -> Result<Json<ServiceEnvelope<Document>>, ServiceError> {
    let token = authorize(&state, &headers)?;
    let id = DocumentId::parse(&document_id).map_err(service_error)?;
    let document =
        state.api.set_document_active(&token, id, request.active).map_err(service_error)?;
    Ok(Json(envelope(document)))
}

async fn add_category<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    headers: HeaderMap,
    Json(request): Json<AddCategoryRequest>,
) -> Result<Json<ServiceEnvelope<Category>>, ServiceError> {
    let token = authorize(&state, &headers)?;
    let category = state.api.add_category(&token, request).map_err(service_error)?;
    Ok(Json(envelope(category)))
}

async fn list_categories<G: Generator + 'static>(
    State(state): State<ServiceState<G>>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Category>>>, ServiceError> {
    authorize(&state, &headers)?;
    let categories = state.api.list_categories().map_err(service_error)?;
    Ok(Json(envelope(categories)))
}
