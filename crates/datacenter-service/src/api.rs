//! HTTP control and status surface.
//!
//! Handlers only translate between HTTP and [`DataCenterService`]; every
//! JSON response uses the `{code, message, data}` envelope.

use crate::service::{DataCenterService, Statistics};
use axum::{
	extract::{rejection::QueryRejection, Query, State},
	http::StatusCode,
	response::{
		sse::{Event, Sse},
		IntoResponse, Json, Response,
	},
	routing::{get, post},
	Router,
};
use datacenter_core::{CoreError, StreamFrame};
use datacenter_types::{
	ApiResponse, HealthReport, LogEntry, LogsQuery, LogsResponse, ServiceState, StateResponse,
};
use futures::{future, stream, Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
	service: Arc<DataCenterService>,
}

/// All routes, with request tracing and permissive CORS.
pub fn router(service: Arc<DataCenterService>) -> Router {
	Router::new()
		.route("/start", post(start))
		.route("/stop", post(stop))
		.route("/restart", post(restart))
		.route("/status", get(status))
		.route("/logs", get(logs))
		.route("/logs/stream", get(stream_logs))
		.route("/health", get(health))
		.route("/statistics", get(statistics))
		.fallback(not_found)
		.with_state(AppState { service })
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve(
	service: Arc<DataCenterService>,
	listener: TcpListener,
	shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
	if let Ok(address) = listener.local_addr() {
		info!(%address, "HTTP API listening");
	}
	axum::serve(listener, router(service))
		.with_graceful_shutdown(shutdown)
		.await?;
	Ok(())
}

/// A failed request, rendered as an envelope whose `code` is the HTTP status.
#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	message: String,
	data: Option<ServiceState>,
}

impl ApiError {
	fn new(status: StatusCode, message: impl Into<String>) -> Self {
		Self {
			status,
			message: message.into(),
			data: None,
		}
	}

	fn with_state(mut self, state: ServiceState) -> Self {
		self.data = Some(state);
		self
	}

	/// Maps a control failure. Failures that changed module state carry
	/// the state after the operation.
	fn control(err: CoreError, service: &DataCenterService) -> Self {
		match err {
			CoreError::ControlConflict => Self::new(StatusCode::CONFLICT, err.to_string()),
			CoreError::AlreadyRunning => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
			err if err.is_registration() => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
			err => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
				.with_state(service.status()),
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body: StateResponse =
			ApiResponse::failure(i32::from(self.status.as_u16()), self.message, self.data);
		(self.status, Json(body)).into_response()
	}
}

/// Runs a control operation on its own task so it completes even when the
/// client goes away mid-request.
async fn detached<T, F>(service: &Arc<DataCenterService>, operation: F) -> Result<T, ApiError>
where
	F: Future<Output = Result<T, CoreError>> + Send + 'static,
	T: Send + 'static,
{
	match tokio::spawn(operation).await {
		Ok(Ok(value)) => Ok(value),
		Ok(Err(e)) => {
			warn!(
				module = e.module().unwrap_or_default(),
				error = %e,
				"Control operation failed"
			);
			Err(ApiError::control(e, service))
		}
		Err(e) => Err(ApiError::new(
			StatusCode::INTERNAL_SERVER_ERROR,
			format!("Control operation aborted: {}", e),
		)
		.with_state(service.status())),
	}
}

async fn start(State(state): State<AppState>) -> Result<Json<StateResponse>, ApiError> {
	let service = state.service.clone();
	let started = detached(&state.service, async move { service.start().await }).await?;
	Ok(Json(ApiResponse::ok("Data center started", started)))
}

async fn stop(State(state): State<AppState>) -> Result<Json<StateResponse>, ApiError> {
	let service = state.service.clone();
	let report = detached(&state.service, async move { service.stop().await }).await?;

	if report.is_clean() {
		return Ok(Json(ApiResponse::ok("Data center stopped", report.state)));
	}
	let failures: Vec<String> = report.failures.iter().map(|e| e.to_string()).collect();
	Err(ApiError::new(
		StatusCode::INTERNAL_SERVER_ERROR,
		format!("Stopped with failures: {}", failures.join("; ")),
	)
	.with_state(report.state))
}

async fn restart(State(state): State<AppState>) -> Result<Json<StateResponse>, ApiError> {
	let service = state.service.clone();
	let restarted = detached(&state.service, async move { service.restart().await }).await?;
	Ok(Json(ApiResponse::ok("Data center restarted", restarted)))
}

async fn status(State(state): State<AppState>) -> Json<StateResponse> {
	Json(ApiResponse::ok("ok", state.service.status()))
}

async fn logs(
	State(state): State<AppState>,
	query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<LogsResponse>, ApiError> {
	let Query(query) =
		query.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
	let entries: Vec<LogEntry> = state.service.recent_logs(query.limit);
	Ok(Json(ApiResponse::ok("ok", entries)))
}

/// Live log feed. Opens with the reconnect hint, then relays `log` and
/// `ping` events until the broadcaster ends the stream.
async fn stream_logs(
	State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
	let retry = state.service.config().log_stream.reconnect_delay();
	let hint = stream::once(future::ready(Ok::<_, axum::Error>(
		Event::default().retry(retry),
	)));
	let frames = state.service.broadcaster().connect().map(frame_event);
	Sse::new(hint.chain(frames))
}

fn frame_event(frame: StreamFrame) -> Result<Event, axum::Error> {
	let event = Event::default().event(frame.event_name());
	match &frame {
		StreamFrame::Log(entry) => event.json_data(entry),
		StreamFrame::Ping(heartbeat) => event.json_data(heartbeat),
	}
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthReport>>) {
	let report = state.service.health().await;
	if report.healthy {
		(StatusCode::OK, Json(ApiResponse::ok("healthy", report)))
	} else {
		let code = StatusCode::SERVICE_UNAVAILABLE;
		let body = ApiResponse::failure(i32::from(code.as_u16()), "unhealthy", Some(report));
		(code, Json(body))
	}
}

async fn statistics(State(state): State<AppState>) -> Json<ApiResponse<Statistics>> {
	Json(ApiResponse::ok("ok", state.service.statistics()))
}

async fn not_found() -> ApiError {
	ApiError::new(StatusCode::NOT_FOUND, "Not found")
}
