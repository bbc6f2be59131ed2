//! Configuration validation utility
//!
//! Usage: cargo run --bin validate-config config/datacenter.toml

use std::env;
use std::process;

use datacenter_config::ConfigLoader;

fn main() {
	let args: Vec<String> = env::args().collect();

	if args.len() != 2 {
		eprintln!("Usage: {} <config-file>", args[0]);
		process::exit(1);
	}

	let config_path = &args[1];

	println!("Validating configuration file: {}", config_path);

	match ConfigLoader::from_file(config_path) {
		Ok(config) => {
			println!("✅ Configuration is valid!");
			println!("Service name: {}", config.service.name);
			println!("Listen address: {}", config.service.bind_address());
			println!(
				"Start timeout: {}s ({} module overrides)",
				config.orchestrator.start_timeout_secs,
				config.orchestrator.module_start_timeouts.len()
			);
			println!(
				"Event bus: capacity {} / {}",
				config.event_bus.subscriber_capacity, config.event_bus.overflow_policy
			);
			println!(
				"Log history: {} entries, stream level {}",
				config.logs.history_size, config.logs.stream_level
			);
		}
		Err(e) => {
			eprintln!("❌ Configuration validation failed:");
			eprintln!("{}", e);
			process::exit(1);
		}
	}
}
