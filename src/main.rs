mod batch;
mod config;
mod extraction;
mod http;
mod interview;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod recipe;
mod sandbox;
mod storage;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use batch::RerunScope;
use config::Settings;
use eyre::WrapErr;
use futures::{Stream, StreamExt, future::ready};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ProgressEvent, StyleProfile};
use pipeline::{
    AutoRefineResponse, ExtractRequest, ExtractResponse, Pipeline, PipelineError,
    PipelineErrorKind, RefineRequest, StyleChatRequest, StyleChatResponse, TestRequest,
    TestResponse,
};
use recipe::{Recipe, RecipeSummary};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "listing.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::from_env();
    if settings.gemini.api_key.is_none() {
        warn!(target = "listing.api", "GEMINI_API_KEY is not set; model calls will fail");
    }
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let port = settings.port;
    let body_limit = settings.request_max_bytes;
    let pipeline = Pipeline::from_settings(settings);
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let state = AppState {
        pipeline,
        queue,
        prometheus_handle,
        metrics_key: std::env::var("METRICS_KEY")
            .ok()
            .filter(|key| !key.is_empty()),
    };

    let app = router(state, body_limit);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "listing.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let recipe_routes = Router::new()
        .route("/draft", post(draft_recipe))
        .route("/test", post(test_recipe))
        .route("/refine", post(refine_recipe))
        .route("/auto-refine", post(auto_refine))
        .route("/approve", post(approve_recipe))
        .route("/history", get(recipe_history));

    let job_routes = Router::new()
        .route("/{id}/extract", post(extract))
        .route("/{id}/style", put(put_style))
        .route("/{id}/style/chat", post(style_chat))
        .nest("/{id}/recipe", recipe_routes)
        .route("/{id}/execute", post(execute_batch))
        .route("/{id}/cancel", post(cancel_batch))
        .route("/{id}/status", get(job_status))
        .route("/{id}/events", get(job_events));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/jobs", job_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-agent-rs",
    }))
}

/// Prometheus text exposition, behind `X-Metrics-Key` when `METRICS_KEY` is set.
async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Build the job's catalog from inline data, an uploaded file, or its images.
///
/// - Method: `POST`
/// - Path: `/jobs/{id}/extract`
/// - Body: `ExtractRequest`
/// - Response: `ExtractResponse` (data model, program fingerprint, usage)
async fn extract(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    metrics::inc_requests("/jobs/{id}/extract");
    Ok(Json(state.pipeline.extract(&id, request).await?))
}

async fn put_style(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(style): Json<StyleProfile>,
) -> Result<Json<StyleProfile>, AppError> {
    metrics::inc_requests("/jobs/{id}/style");
    Ok(Json(state.pipeline.put_style(&id, style)?))
}

/// One turn of the style interview.
///
/// - Method: `POST`
/// - Path: `/jobs/{id}/style/chat`
/// - Body (optional): `{"message": "...", "restart": false}`; no message opens the interview
/// - Response: `{"response", "phase": "interviewing" | "profile_ready", "style_profile", "usage"}`
async fn style_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<StyleChatRequest>>,
) -> Result<Json<StyleChatResponse>, AppError> {
    metrics::inc_requests("/jobs/{id}/style/chat");
    let request = request.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.pipeline.style_chat(&id, request).await?))
}

async fn draft_recipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Recipe>, AppError> {
    metrics::inc_requests("/jobs/{id}/recipe/draft");
    Ok(Json(state.pipeline.draft_recipe(&id).await?))
}

/// Grade the current recipe on sample items.
///
/// - Method: `POST`
/// - Path: `/jobs/{id}/recipe/test`
/// - Body (optional): `{"sample_ids": [...]}`; a diverse pick of three otherwise
async fn test_recipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<TestRequest>>,
) -> Result<Json<TestResponse>, AppError> {
    metrics::inc_requests("/jobs/{id}/recipe/test");
    let request = request.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.pipeline.test_recipe(&id, request).await?))
}

async fn refine_recipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<RefineRequest>>,
) -> Result<Json<Recipe>, AppError> {
    metrics::inc_requests("/jobs/{id}/recipe/refine");
    let request = request.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.pipeline.refine_recipe(&id, request).await?))
}

async fn auto_refine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<TestRequest>>,
) -> Result<Json<AutoRefineResponse>, AppError> {
    metrics::inc_requests("/jobs/{id}/recipe/auto-refine");
    let request = request.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.pipeline.auto_refine(&id, request).await?))
}

async fn approve_recipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Recipe>, AppError> {
    metrics::inc_requests("/jobs/{id}/recipe/approve");
    Ok(Json(state.pipeline.approve_recipe(&id)?))
}

async fn recipe_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RecipeSummary>>, AppError> {
    metrics::inc_requests("/jobs/{id}/recipe/history");
    Ok(Json(state.pipeline.recipe_history(&id)?))
}

/// Queue the approved recipe over the catalog.
///
/// - Method: `POST`
/// - Path: `/jobs/{id}/execute`
/// - Body (optional): `{"scope": "pending" | "failed"}` or `{"scope": "ids", "ids": [...]}`
/// - Response: `202` with the job's queue state; progress on `/jobs/{id}/events`
async fn execute_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    scope: Option<Json<RerunScope>>,
) -> Result<(StatusCode, Json<jobs::JobInfo>), AppError> {
    metrics::inc_requests("/jobs/{id}/execute");
    let scope = scope.map(|Json(body)| body).unwrap_or_default();
    let run = state.pipeline.prepare_batch(&id, scope)?;
    let info = state.queue.enqueue(run).await?;
    info!(target = "listing.api", job_id = %info.id, "batch_enqueued");
    Ok((StatusCode::ACCEPTED, Json(info)))
}

async fn cancel_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    metrics::inc_requests("/jobs/{id}/cancel");
    let id = state.pipeline.job_id(&id)?;
    if !state.queue.cancel(&id).await {
        return Err(PipelineError::not_found("cancel", "no batch is queued or running").into());
    }
    Ok(Json(json!({"job_id": id, "cancelling": true})))
}

/// Queue state of the job's batch, or the report left on disk by an earlier run.
async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let id = state.pipeline.job_id(&id)?;
    if let Some(info) = state.queue.get(&id).await {
        return Ok(Json(info));
    }
    match state.pipeline.batch_report(&id)? {
        Some(report) => Ok(Json(jobs::JobInfo {
            id,
            state: jobs::JobState::Completed { report },
        })),
        None => Err(PipelineError::not_found("jobs", "no batch has run for this job").into()),
    }
}

/// Server-sent progress events. The stream ends after `batch_complete`.
async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let id = state.pipeline.job_id(&id)?;
    let rx = state.queue.subscribe(&id).await.ok_or_else(|| {
        PipelineError::not_found("events", format!("job {id} does not exist"))
    })?;
    let stream = BroadcastStream::new(rx)
        .filter_map(move |item| {
            ready(match item {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(target = "listing.api", job_id = %id, error = %err, "progress_subscriber_lagged");
                    None
                }
            })
        })
        .scan(false, |finished, event| {
            if *finished {
                return ready(None);
            }
            *finished = matches!(event, ProgressEvent::BatchComplete { .. });
            ready(Some(event))
        })
        .filter_map(|event| ready(sse_event(&event).map(Ok)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &ProgressEvent) -> Option<Event> {
    let value = serde_json::to_value(event).ok()?;
    let name = value
        .get("type")
        .and_then(|kind| kind.as_str())
        .unwrap_or("message")
        .to_string();
    Event::default().event(name).json_data(value).ok()
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(target = "listing.api", stage = err.stage(), error = %err, "request_failed");
                }
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path, metrics_key: Option<&str>) -> (Pipeline, Router) {
        let replies = (0..3).map(|_| pipeline::testing::listing_reply()).collect();
        let (_, pipeline) = pipeline::testing::pipeline(dir, replies);
        let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
        let state = AppState {
            pipeline: pipeline.clone(),
            queue,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            metrics_key: metrics_key.map(str::to_string),
        };
        (pipeline, router(state, 64 * 1024))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, app) = app(dir.path(), None);
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_require_the_key_when_configured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, app) = app(dir.path(), Some("s3cret"));
        let (status, _) = send(&app, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/metrics")
            .header("X-Metrics-Key", "s3cret")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn error_kinds_map_to_statuses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, app) = app(dir.path(), None);

        let (status, body) =
            send(&app, "POST", "/jobs/not-a-uuid/extract", Some(json!({"data": "a,b\n1,2"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "extract");

        let unknown = uuid::Uuid::new_v4();
        let (status, _) = send(&app, "POST", &format!("/jobs/{unknown}/recipe/draft"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", &format!("/jobs/{unknown}/status"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", &format!("/jobs/{unknown}/cancel"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(&app, "GET", &format!("/jobs/{unknown}/events"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "events");
    }

    #[tokio::test]
    async fn execute_queues_once_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, app) = app(dir.path(), None);
        let id = pipeline::testing::seed_approved_job(&pipeline);

        let (status, body) = send(&app, "POST", &format!("/jobs/{id}/execute"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"], "queued");
        assert_eq!(body["id"], id.as_str());

        let (status, body) = send(
            &app,
            "POST",
            &format!("/jobs/{id}/execute"),
            Some(json!({"scope": "failed"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "execute_batch");

        let mut state = Value::Null;
        for _ in 0..200 {
            let (_, body) = send(&app, "GET", &format!("/jobs/{id}/status"), None).await;
            state = body;
            if state["state"] == "completed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state["state"], "completed");
        assert_eq!(state["report"]["succeeded"], 3);

        let (status, body) = send(&app, "GET", &format!("/jobs/{id}/recipe/history"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["approved"], true);
    }

    #[tokio::test]
    async fn style_chat_needs_an_existing_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, app) = app(dir.path(), None);
        let unknown = uuid::Uuid::new_v4();
        let (status, _) = send(&app, "POST", &format!("/jobs/{unknown}/style/chat"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn style_round_trips_through_put() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, app) = app(dir.path(), None);
        let id = uuid::Uuid::new_v4();
        let (status, body) = send(
            &app,
            "PUT",
            &format!("/jobs/{id}/style"),
            Some(json!({"platform": "etsy", "always_mention": ["handmade"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["platform"], "etsy");
        assert_eq!(body["always_mention"][0], "handmade");
    }
}
