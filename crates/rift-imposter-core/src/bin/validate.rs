//! Rift Imposter Validator CLI Tool
//!
//! Loads imposter configurations and certifies them by dry-running every
//! stub through the matching and resolution core, without opening sockets
//! or calling proxy destinations.
//!
//! Usage:
//!   rift-validate imposters.json [--config engine.yaml] [--allow-injection]
//!
//! A file may hold a single imposter or `{"imposters": [...]}`. The result
//! is printed as JSON; the exit code is 1 when any imposter is invalid.

use anyhow::Context;
use clap::Parser;
use rift_imposter_core::{DryRunValidator, EngineConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Rift Imposter Validator - dry-run imposter configurations
#[derive(Parser, Debug)]
#[command(name = "rift-validate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Imposter files (JSON or YAML)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Engine configuration file (JSON or YAML)
    #[arg(short, long, env = "RIFT_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Permit JavaScript injection and shell execution
    #[arg(long)]
    allow_injection: bool,

    /// Log filter, overrides the configured logLevel
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,
}

fn load_imposters(path: &Path) -> anyhow::Result<Vec<Value>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let document: Value =
        serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(match document.get("imposters") {
        Some(Value::Array(imposters)) => imposters.clone(),
        _ => vec![document],
    })
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let mut engine = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Invalid engine configuration {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.allow_injection {
        engine.allow_injection = true;
    }

    let filter = args.log_level.clone().unwrap_or_else(|| engine.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let validator = DryRunValidator::new(&engine);
    let mut all_valid = true;
    let mut reports = Vec::new();

    for file in &args.files {
        for imposter in load_imposters(file)? {
            let result = validator.validate(&imposter).await;
            if result.is_valid {
                tracing::info!("{}: valid", describe(file, &imposter));
            } else {
                tracing::warn!(
                    "{}: {} error(s)",
                    describe(file, &imposter),
                    result.errors.len()
                );
                all_valid = false;
            }
            reports.push(json!({
                "file": file.display().to_string(),
                "port": imposter.get("port"),
                "isValid": result.is_valid,
                "errors": result.errors
            }));
        }
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(all_valid)
}

fn describe(file: &Path, imposter: &Value) -> String {
    match imposter.get("port") {
        Some(port) => format!("{} (port {})", file.display(), port),
        None => file.display().to_string(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}
