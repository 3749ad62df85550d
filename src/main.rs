// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use otto_core::{Engine, ListSource, SessionManager};
use otto_services::ServiceCatalog;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("OTTO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Subcommands that never start the server.
    match &cli.command {
        Some(Commands::ShowConfig) => {
            return match otto_config::load(cli.config.as_deref()) {
                Ok(config) => {
                    println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("failed to load config: {e:#}");
                    ExitCode::from(1)
                }
            };
        }
        Some(Commands::ListProviders { json }) => {
            return list_providers(*json);
        }
        Some(Commands::Sessions { source }) => {
            return list_sessions(cli.config.as_deref(), source).await;
        }
        _ => {}
    }

    // `serve` is the default command.
    let (host, port) = match &cli.command {
        Some(Commands::Serve { host, port }) => (host.clone(), *port),
        _ => (None, None),
    };

    match build_runtime(cli.config.as_deref(), host, port).await {
        Ok((listener, engine)) => match run_server(listener, engine).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("unrecoverable runtime error: {e:#}");
                ExitCode::from(2)
            }
        },
        Err(e) => {
            error!("initialization failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Build everything the server needs.  Failures here are fatal
/// initialization errors (exit code 1).
async fn build_runtime(
    config_path: Option<&std::path::Path>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<(tokio::net::TcpListener, Arc<Engine>)> {
    let config = otto_config::load(config_path)?;
    let catalog = Arc::clone(ServiceCatalog::global());
    let manager = SessionManager::new(&config, catalog).context("creating session manager")?;
    let engine = Arc::new(Engine::new(
        Arc::new(manager),
        config.runtime.effective_worker_cap(),
    ));

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    Ok((listener, engine))
}

/// Serve until SIGINT, then drain sessions.  Failures here are
/// unrecoverable runtime errors (exit code 2).
async fn run_server(
    listener: tokio::net::TcpListener,
    engine: Arc<Engine>,
) -> anyhow::Result<()> {
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    otto_server::serve_until(listener, Arc::clone(&engine), shutdown).await?;
    engine.manager().shutdown().await;
    info!("all sessions closed; exiting");
    Ok(())
}

fn list_providers(json: bool) -> ExitCode {
    let drivers = otto_model::list_drivers();
    if json {
        let rows: Vec<serde_json::Value> = drivers
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "description": d.description,
                    "requires_api_key": d.requires_api_key,
                    "api_key_env": d.default_api_key_env,
                    "default_base_url": d.default_base_url,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows).unwrap_or_default());
    } else {
        for d in drivers {
            let key = match d.default_api_key_env {
                Some(env) => format!("key: {env}"),
                None => "no key required".into(),
            };
            println!("{:<12} {:<18} {} ({key})", d.id, d.name, d.description);
        }
    }
    ExitCode::SUCCESS
}

async fn list_sessions(config_path: Option<&std::path::Path>, source: &str) -> ExitCode {
    let result = async {
        let source: ListSource = source.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
        let config = otto_config::load(config_path)?;
        let manager = SessionManager::new(&config, Arc::clone(ServiceCatalog::global()))?;
        let sessions = manager.list(source).await.map_err(|e| anyhow::anyhow!("{e}"))?;
        if sessions.is_empty() {
            println!("no sessions");
        }
        for s in sessions {
            println!(
                "{:<24} {:<20} {}/{} (updated {})",
                s.id, s.display_name, s.provider, s.model, s.updated_at
            );
        }
        anyhow::Ok(())
    }
    .await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
