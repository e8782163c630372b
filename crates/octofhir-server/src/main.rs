use std::process::ExitCode;

use anyhow::Context;
use octofhir_server::ServerBuilder;
use octofhir_server::config::loader::load_config;
use octofhir_server::observability::{apply_logging_level, init_tracing};

const DEFAULT_CONFIG: &str = "octofhir.toml";
const CONFIG_ENV: &str = "OCTOFHIR_CONFIG";

/// Configuration file to load and where its path came from.
#[derive(Debug)]
struct ConfigPath {
    path: String,
    origin: &'static str,
}

impl ConfigPath {
    /// `--config <path>`, then `OCTOFHIR_CONFIG`, then `octofhir.toml`.
    fn resolve(mut args: impl Iterator<Item = String>) -> Self {
        while let Some(arg) = args.next() {
            let value = match arg.strip_prefix("--config=") {
                Some(v) => Some(v.to_string()),
                None if arg == "--config" => args.next(),
                None => None,
            };
            if let Some(path) = value {
                return Self {
                    path,
                    origin: "--config",
                };
            }
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self {
                path,
                origin: CONFIG_ENV,
            },
            _ => Self {
                path: DEFAULT_CONFIG.to_string(),
                origin: "default",
            },
        }
    }
}

enum Failure {
    Config(String),
    Startup(anyhow::Error),
    Serve(anyhow::Error),
}

async fn run() -> Result<(), Failure> {
    let config = ConfigPath::resolve(std::env::args().skip(1));
    let cfg = load_config(Some(&config.path)).map_err(Failure::Config)?;
    tracing::info!(path = %config.path, origin = config.origin, "Configuration loaded");
    apply_logging_level(&cfg.logging.level);

    let server = ServerBuilder::new()
        .with_config(cfg)
        .build()
        .await
        .context("initializing services")
        .map_err(Failure::Startup)?;
    server.run().await.map_err(Failure::Serve)
}

#[tokio::main]
async fn main() -> ExitCode {
    match dotenvy::dotenv() {
        Err(e) if !e.not_found() => eprintln!("Warning: ignoring .env: {e}"),
        _ => {}
    }
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Config(e)) => {
            eprintln!("Configuration error: {e}");
            ExitCode::from(2)
        }
        Err(Failure::Startup(e)) => {
            eprintln!("Startup failed: {e:#}");
            ExitCode::from(2)
        }
        Err(Failure::Serve(e)) => {
            eprintln!("Server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
