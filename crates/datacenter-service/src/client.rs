//! HTTP client for a running data center, used by the CLI commands.

use anyhow::{Context, Result};
use datacenter_core::StreamFrame;
use datacenter_types::{ApiResponse, HealthReport, LogsResponse, StateResponse};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DataCenterClient {
	base_url: String,
	http: reqwest::Client,
}

impl DataCenterClient {
	pub fn new(base_url: impl Into<String>) -> Result<Self> {
		let http = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(5))
			.build()
			.context("Failed to build HTTP client")?;
		Ok(Self {
			base_url: base_url.into().trim_end_matches('/').to_string(),
			http,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	pub async fn status(&self) -> Result<StateResponse> {
		self.get("/status").await
	}

	pub async fn start(&self) -> Result<StateResponse> {
		self.post("/start").await
	}

	pub async fn stop(&self) -> Result<StateResponse> {
		self.post("/stop").await
	}

	pub async fn restart(&self) -> Result<StateResponse> {
		self.post("/restart").await
	}

	pub async fn health(&self) -> Result<ApiResponse<HealthReport>> {
		self.get("/health").await
	}

	pub async fn logs(&self, limit: Option<usize>) -> Result<LogsResponse> {
		let path = match limit {
			Some(limit) => format!("/logs?limit={}", limit),
			None => "/logs".to_string(),
		};
		self.get(&path).await
	}

	async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>> {
		let response = self
			.http
			.get(self.url(path))
			.timeout(REQUEST_TIMEOUT)
			.send()
			.await
			.with_context(|| format!("GET {} failed", path))?;
		envelope(response).await
	}

	async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>> {
		let response = self
			.http
			.post(self.url(path))
			.timeout(REQUEST_TIMEOUT)
			.send()
			.await
			.with_context(|| format!("POST {} failed", path))?;
		envelope(response).await
	}

	/// Follows the live log stream until `token` is cancelled.
	///
	/// Each connection is consumed until the server closes it or it fails,
	/// then reopened after `reconnect_delay`. A `retry` hint sent by the
	/// server replaces the delay. Frames from before a reconnect are not
	/// replayed.
	pub async fn follow<F>(
		&self,
		reconnect_delay: Duration,
		token: CancellationToken,
		mut on_frame: F,
	) -> Result<()>
	where
		F: FnMut(StreamFrame),
	{
		let mut delay = reconnect_delay;
		loop {
			if token.is_cancelled() {
				break;
			}

			match self.consume_stream(&token, &mut on_frame, &mut delay).await {
				Ok(()) => info!("Log stream closed"),
				Err(e) => warn!(error = %format!("{:#}", e), "Log stream failed"),
			}

			if token.is_cancelled() {
				break;
			}
			info!(delay_ms = delay.as_millis() as u64, "Reconnecting to log stream");
			tokio::select! {
				_ = token.cancelled() => break,
				_ = tokio::time::sleep(delay) => {}
			}
		}
		Ok(())
	}

	async fn consume_stream<F>(
		&self,
		token: &CancellationToken,
		on_frame: &mut F,
		delay: &mut Duration,
	) -> Result<()>
	where
		F: FnMut(StreamFrame),
	{
		let response = tokio::select! {
			_ = token.cancelled() => return Ok(()),
			response = self.http.get(self.url("/logs/stream")).header(ACCEPT, "text/event-stream").send() => response,
		};
		let response = response
			.context("Failed to open log stream")?
			.error_for_status()
			.context("Log stream refused")?;
		debug!("Log stream connected");

		let mut body = response.bytes_stream();
		let mut parser = SseParser::default();
		loop {
			let chunk = tokio::select! {
				_ = token.cancelled() => return Ok(()),
				chunk = body.next() => chunk,
			};
			let bytes = match chunk {
				Some(chunk) => chunk.context("Log stream interrupted")?,
				None => return Ok(()),
			};

			for message in parser.feed(&bytes) {
				match decode_frame(&message) {
					Ok(Some(frame)) => on_frame(frame),
					Ok(None) => debug!(event = %message.event, "Ignoring stream event"),
					Err(e) => warn!(error = %e, "Malformed stream event"),
				}
			}
			if let Some(retry) = parser.retry() {
				*delay = retry;
			}
		}
	}
}

/// Failure envelopes are returned as values; only transport and decoding
/// problems are errors.
async fn envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<ApiResponse<T>> {
	let status = response.status();
	response
		.json::<ApiResponse<T>>()
		.await
		.with_context(|| format!("Unexpected response body (HTTP {})", status))
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
	pub event: String,
	pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
	pending: Vec<u8>,
	event: Option<String>,
	data: Vec<String>,
	retry: Option<Duration>,
}

impl SseParser {
	pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
		self.pending.extend_from_slice(chunk);
		let mut messages = Vec::new();
		while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
			let raw: Vec<u8> = self.pending.drain(..=end).collect();
			let line = String::from_utf8_lossy(&raw);
			if let Some(message) = self.line(line.trim_end_matches(['\n', '\r'])) {
				messages.push(message);
			}
		}
		messages
	}

	/// Latest reconnect delay advertised by the server.
	pub fn retry(&self) -> Option<Duration> {
		self.retry
	}

	fn line(&mut self, line: &str) -> Option<SseMessage> {
		if line.is_empty() {
			return self.dispatch();
		}
		if line.starts_with(':') {
			return None;
		}

		let (field, value) = match line.split_once(':') {
			Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
			None => (line, ""),
		};
		match field {
			"event" => self.event = Some(value.to_string()),
			"data" => self.data.push(value.to_string()),
			"retry" => {
				if let Ok(ms) = value.parse::<u64>() {
					self.retry = Some(Duration::from_millis(ms));
				}
			}
			_ => {}
		}
		None
	}

	fn dispatch(&mut self) -> Option<SseMessage> {
		let event = self.event.take();
		if self.data.is_empty() {
			return None;
		}
		let data = self.data.join("\n");
		self.data.clear();
		Some(SseMessage {
			event: event.unwrap_or_else(|| "message".to_string()),
			data,
		})
	}
}

/// `log` and `ping` events become frames; other events are skipped.
pub fn decode_frame(message: &SseMessage) -> Result<Option<StreamFrame>, serde_json::Error> {
	match message.event.as_str() {
		"log" => serde_json::from_str(&message.data).map(|entry| Some(StreamFrame::Log(entry))),
		"ping" => serde_json::from_str(&message.data).map(|beat| Some(StreamFrame::Ping(beat))),
		_ => Ok(None),
	}
}
