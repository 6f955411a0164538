//! Identity-aware server (v1)
//!
//! Serves a small echo service over mutual TLS using a SPIFFE workload
//! identity read from PEM files.
//!
//! # Architecture Overview
//!
//! ```text
//!   config (TOML) ──▶ ServerOptions ──▶ IdentityServer
//!                                           │
//!        PemFileProvider ──▶ IdentityBinding ┤
//!                                           ▼
//!                   AxumTransport (rustls, client certs required)
//!                                           │
//!   SIGTERM / SIGINT / SIGQUIT ──▶ shutdown: pre-hook → stop → drain
//!                                  → close → cleanup → post-hook
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;

use identity_server::config::{load_config_or_default, ServerConfig};
use identity_server::identity::{IdentityProvider, IdentityWatcher, PemFileProvider};
use identity_server::lifecycle::{BoxError, IdentityServer, ServerOptions};
use identity_server::net::{AxumTransport, ServiceRegistrar};
use identity_server::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "identity-server")]
#[command(about = "Serve a workload over mutual TLS with a SPIFFE identity", long_about = None)]
struct Args {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Echoes request bodies and reports server status.
struct EchoService {
    name: String,
    server: IdentityServer,
}

impl ServiceRegistrar for EchoService {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn routes(&self) -> Router {
        let server = self.server.clone();
        Router::new()
            .route("/echo", post(|body: String| async move { body }))
            .route(
                "/healthz",
                get(move || {
                    let server = server.clone();
                    async move {
                        Json(json!({
                            "state": server.state().as_str(),
                            "server_id": server.id().to_string(),
                            "spiffe_id": server.binding().map(|b| b.spiffe_id().to_string()),
                        }))
                    }
                }),
            )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("identity-server: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref())?;
    logging::init(&config.observability)?;

    tracing::info!(
        service = %config.service.name,
        trust_domain = %config.service.domain,
        bind_address = %config.listener.bind_address,
        "identity-server v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let provider = Arc::new(PemFileProvider::new(
        &config.identity.cert_path,
        &config.identity.key_path,
        &config.identity.bundle_path,
    ));
    let server = build_server(&config, Arc::clone(&provider) as Arc<dyn IdentityProvider>);

    server.register_service(Arc::new(EchoService {
        name: config.service.name.clone(),
        server: server.clone(),
    }))?;
    let closing = Arc::clone(&provider);
    server.register_named_cleanup_func("identity-provider", move || async move {
        closing.close().await?;
        Ok::<(), BoxError>(())
    })?;

    let _watch = if config.identity.watch {
        let paths = provider.paths().map(Path::to_path_buf);
        Some(IdentityWatcher::new(server.clone(), paths).run()?)
    } else {
        None
    };

    let transport = AxumTransport::bind(&config.listener).await?;
    let result = server.serve(transport).await;

    match &result {
        Ok(()) => tracing::info!(state = %server.state(), "Shutdown complete"),
        Err(e) => tracing::error!(state = %server.state(), error = %e, "Server stopped with errors"),
    }
    Ok(result?)
}

fn build_server(config: &ServerConfig, provider: Arc<dyn IdentityProvider>) -> IdentityServer {
    let options = ServerOptions::from_config(config).with_signal_handling(true);
    let shutdown = options
        .shutdown
        .clone()
        .on_shutdown_start(|| tracing::info!("Shutdown started"))
        .on_shutdown_complete(|err| match err {
            Some(e) => tracing::warn!(errors = e.len(), "Shutdown finished with errors"),
            None => tracing::info!("Shutdown finished cleanly"),
        });

    IdentityServer::new(options.with_shutdown(shutdown), provider)
}
