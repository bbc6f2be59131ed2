use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use datacenter_config::{load_config, ConfigLoader, DataCenterConfig};
use datacenter_core::StreamFrame;
use datacenter_monitoring::{init_tracing, TracingConfig};
use datacenter_service::{
	api,
	cli::{Args, Command},
	client::DataCenterClient,
	service::DataCenterService,
};
use datacenter_types::{ApiResponse, LogEntry};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	match args.command() {
		Command::Serve => serve(args).await,
		Command::Validate { config } => validate_config(&config),
		Command::GenerateConfig { output } => generate_config(&output),
		command => run_client(&args, command).await,
	}
}

async fn serve(args: Args) -> Result<()> {
	let mut config = match &args.config {
		Some(path) => ConfigLoader::from_file(path),
		None => load_config(),
	}
	.context("Failed to load configuration")?;
	if let Some(level) = &args.log_level {
		config.monitoring.log_level = level.clone();
	}
	if args.auto_start {
		config.service.auto_start = true;
	}

	let service = Arc::new(DataCenterService::new(config.clone()));

	let sink = service.log_sink();
	let tracing_config = TracingConfig::from_settings(&config.monitoring, &config.logs)
		.with_forwarding(Arc::new(move |entry: LogEntry| sink.record(entry)));
	init_tracing(tracing_config).map_err(|e| anyhow!(e))?;

	info!(name = %config.service.name, "Starting data center");
	service
		.register_builtin_modules()
		.context("Failed to register built-in modules")?;

	let listener = tokio::net::TcpListener::bind(config.service.bind_address())
		.await
		.with_context(|| format!("Failed to bind {}", config.service.bind_address()))?;

	if config.service.auto_start {
		match service.start().await {
			Ok(state) => info!(modules = state.modules.len(), "Auto start complete"),
			Err(e) => error!(error = %e, "Auto start failed"),
		}
	}

	let stopping = service.clone();
	let shutdown = async move {
		shutdown_signal().await;
		info!("Shutdown signal received, stopping modules");
		stopping.shutdown().await;
	};
	api::serve(service, listener, shutdown).await?;

	info!("Data center stopped");
	Ok(())
}

async fn run_client(args: &Args, command: Command) -> Result<()> {
	init_tracing(TracingConfig::new().with_filter(args.log_level.as_deref().unwrap_or("info")))
		.map_err(|e| anyhow!(e))?;
	let client = DataCenterClient::new(&args.url)?;

	match command {
		Command::Status => print_envelope(client.status().await?),
		Command::Start => print_envelope(client.start().await?),
		Command::Stop => print_envelope(client.stop().await?),
		Command::Restart => print_envelope(client.restart().await?),
		Command::Health => print_envelope(client.health().await?),
		Command::Logs { limit } => {
			let response = client.logs(limit).await?;
			if !response.is_success() {
				bail!("{} (code {})", response.message, response.code);
			}
			for entry in response.data.unwrap_or_default() {
				print_entry(&entry);
			}
			Ok(())
		}
		Command::Follow { reconnect_delay } => {
			let token = CancellationToken::new();
			let cancel = token.clone();
			tokio::spawn(async move {
				shutdown_signal().await;
				cancel.cancel();
			});

			client
				.follow(Duration::from_secs(reconnect_delay), token, |frame| {
					if let StreamFrame::Log(entry) = frame {
						print_entry(&entry);
					}
				})
				.await
		}
		Command::Serve | Command::Validate { .. } | Command::GenerateConfig { .. } => {
			bail!("{:?} is not a client command", command)
		}
	}
}

fn print_envelope<T: Serialize>(response: ApiResponse<T>) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(&response)?);
	if !response.is_success() {
		bail!("{} (code {})", response.message, response.code);
	}
	Ok(())
}

fn print_entry(entry: &LogEntry) {
	let mut line = format!(
		"{} {:<7} {}",
		entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
		entry.level.as_str(),
		entry.message
	);
	for (key, value) in &entry.fields {
		line.push_str(&format!(" {}={}", key, value));
	}
	println!("{}", line);
}

fn validate_config(path: &Path) -> Result<()> {
	let config = ConfigLoader::from_file(path)
		.with_context(|| format!("Invalid configuration: {}", path.display()))?;

	println!("Configuration is valid: {}", path.display());
	println!("  Service: {} on {}", config.service.name, config.service.bind_address());
	println!(
		"  Start timeout: {}s, stop timeout: {}s, health timeout: {}s",
		config.orchestrator.start_timeout_secs,
		config.orchestrator.stop_timeout_secs,
		config.orchestrator.health_timeout_secs
	);
	for (module, secs) in &config.orchestrator.module_start_timeouts {
		println!("    {}: {}s", module, secs);
	}
	println!(
		"  Event bus: capacity {}, {}",
		config.event_bus.subscriber_capacity, config.event_bus.overflow_policy
	);
	println!(
		"  Logs: history {}, default limit {}",
		config.logs.history_size, config.logs.default_limit
	);
	Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
	if output.exists() {
		bail!("Refusing to overwrite {}", output.display());
	}
	if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)
			.with_context(|| format!("Failed to create {}", parent.display()))?;
	}

	let contents = toml::to_string_pretty(&DataCenterConfig::default())
		.context("Failed to serialize default configuration")?;
	std::fs::write(output, contents)
		.with_context(|| format!("Failed to write {}", output.display()))?;
	println!("Wrote example configuration to {}", output.display());
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			warn!(error = %e, "Failed to listen for Ctrl+C");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "Failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
