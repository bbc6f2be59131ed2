//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "datacenter")]
#[command(about = "Data center lifecycle orchestrator", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
	/// Path to configuration file
	#[arg(short, long, env = "DATACENTER_CONFIG")]
	pub config: Option<PathBuf>,

	/// Log level override (trace, debug, info, warn, error)
	#[arg(short, long)]
	pub log_level: Option<String>,

	/// Start all modules once the HTTP API is up
	#[arg(long)]
	pub auto_start: bool,

	/// Base URL of a running data center, for the client commands
	#[arg(long, env = "DATACENTER_URL", default_value = "http://127.0.0.1:8001")]
	pub url: String,

	/// Subcommand to execute
	#[command(subcommand)]
	pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
	/// Run the data center (default)
	#[command(about = "Run the data center with its HTTP API")]
	Serve,

	/// Show the state of a running data center
	Status,

	/// Start all modules of a running data center
	Start,

	/// Stop all modules of a running data center
	Stop,

	/// Restart all modules of a running data center
	Restart,

	/// Show module health of a running data center
	Health,

	/// Print recent log entries
	Logs {
		/// Number of entries, newest last
		#[arg(short = 'n', long)]
		limit: Option<usize>,
	},

	/// Follow the live log stream, reconnecting when it drops
	Follow {
		/// Seconds to wait before reconnecting, unless the server sends a hint
		#[arg(long, default_value_t = 5)]
		reconnect_delay: u64,
	},

	/// Validate configuration file
	#[command(about = "Validate a data center configuration file")]
	Validate {
		/// Path to configuration file to validate
		#[arg(help = "Configuration file to validate")]
		config: PathBuf,
	},

	/// Generate example configuration
	#[command(about = "Generate an example configuration file")]
	GenerateConfig {
		/// Output file path
		#[arg(short, long, default_value = "config/datacenter.toml")]
		#[arg(help = "Output path for the generated configuration")]
		output: PathBuf,
	},
}

impl Args {
	pub fn command(&self) -> Command {
		self.command.clone().unwrap_or(Command::Serve)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_serve_is_default() {
		let args = Args::try_parse_from(["datacenter", "--auto-start"]).unwrap();
		assert!(args.auto_start);
		assert_eq!(args.command(), Command::Serve);
	}

	#[test]
	fn test_logs_limit() {
		let args = Args::try_parse_from(["datacenter", "logs", "-n", "20"]).unwrap();
		assert_eq!(args.command(), Command::Logs { limit: Some(20) });
	}

	#[test]
	fn test_follow_defaults() {
		let args =
			Args::try_parse_from(["datacenter", "--url", "http://dc:9000", "follow"]).unwrap();
		assert_eq!(args.url, "http://dc:9000");
		assert_eq!(args.command(), Command::Follow { reconnect_delay: 5 });
	}

	#[test]
	fn test_validate_requires_path() {
		assert!(Args::try_parse_from(["datacenter", "validate"]).is_err());
	}
}
