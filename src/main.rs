//! ClamAV upload gate CLI.
//!
//! Scans files with the ClamAV daemon and checks scan tokens.

use anyhow::{Context, Result};
use clamav_upload_gate::{ClamdClient, Config, UploadGate, UploadedFile};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Virus-scanning gate for uploads, backed by ClamAV.
#[derive(Parser, Debug)]
#[command(name = "clamav-upload-gate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a file and print the upload response with its scan token.
    Scan {
        /// File to scan.
        file: PathBuf,

        /// Resource the file belongs to, used in logs.
        #[arg(long)]
        resource_id: Option<String>,
    },
    /// Check whether a file may be stored with the given scan token.
    Verify {
        /// File about to be stored.
        file: PathBuf,

        /// Scan token returned by `scan`.
        #[arg(long)]
        token: Option<String>,
    },
    /// Check that clamd answers and print its version.
    Ping,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    if args.example_config {
        println!("{}", Config::example());
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    let Some(command) = args.command else {
        anyhow::bail!("no command given, see --help");
    };

    match command {
        Command::Scan { file, resource_id } => {
            let gate = UploadGate::from_config(&config)?;
            let mut upload = UploadedFile::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;

            let response = gate.evaluate_upload(&mut upload, resource_id.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&response)?);

            Ok(if response.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Verify { file, token } => {
            let gate = UploadGate::from_config(&config)?;
            let mut upload = UploadedFile::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let size = upload.measure_size().await?;

            match gate.authorize_commit(&upload.filename, size, token.as_deref()) {
                Ok(decision) => {
                    println!("{}", serde_json::json!({ "decision": decision }));
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}", serde_json::json!({ "error": e.to_string() }));
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Ping => {
            let client = ClamdClient::from_config(&config.clamd)?;
            if !client.ping().await? {
                anyhow::bail!("clamd at {} did not answer PING", client.endpoint());
            }
            println!("{}", client.version().await?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
