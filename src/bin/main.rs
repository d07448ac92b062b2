// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nas_panel::config::Config;

const DEFAULT_CONFIG: &str = "/etc/nas-panel/nas-panel.toml";

#[derive(Parser, Debug)]
#[command(name = "nas-panel", about = "Samples host telemetry and publishes it over MQTT")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Write a default configuration file to PATH and exit.
    #[arg(long, value_name = "PATH")]
    generate_config: Option<PathBuf>,

    /// Run a single collection cycle, print the payload to stdout, and exit.
    #[arg(short, long)]
    test: bool,

    /// Enable debug-level logging regardless of the configured log level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(path) = &cli.generate_config {
        match Config::generate_default_toml() {
            Ok(content) => match std::fs::write(path, content) {
                Ok(()) => return ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("failed to write {}: {err}", path.display());
                    return ExitCode::FAILURE;
                }
            },
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        }
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let level = if cli.verbose { "debug" } else { config.log.level.as_filter_str() };
    if config.log.console_log || config.log.log_file.is_some() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    }

    if cli.test {
        return match nas_panel::server::run_once(&config).await {
            Ok(telemetry) => match telemetry.to_json_bytes() {
                Ok(bytes) => {
                    println!("{}", String::from_utf8_lossy(&bytes));
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("failed to serialize telemetry: {err}");
                    ExitCode::FAILURE
                }
            },
            Err(err) => {
                eprintln!("{err}");
                ExitCode::FAILURE
            }
        };
    }

    match nas_panel::server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
