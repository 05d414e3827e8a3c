//! Config validation CLI tool
//!
//! Validates an upkeep configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use upkeep_config::ConfigError;
use upkeep_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates an upkeep configuration file.");
            eprintln!();
            eprintln!("Default location: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match upkeep_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Server:");
            println!("  Socket: {}", settings.server.socket_path.display());
            println!("  Data dir: {}", settings.server.data_dir.display());
            println!("  Job timeout: {}s", settings.server.job_timeout.as_secs());
            println!();
            println!("Client:");
            println!("  Socket: {}", settings.client.socket_path.display());
            println!("  Data dir: {}", settings.client.data_dir.display());
            println!("  Flush threshold: {}", settings.client.flush_threshold);
            println!(
                "  Saved indicator: {}ms",
                settings.client.saved_indicator.as_millis()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        upkeep_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
