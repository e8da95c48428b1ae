//! formrun server binary.
//!
//! Serves HTML forms described by a JSON configuration file, validates the
//! submitted values and hands them to the form's script through its
//! environment. The main entry point loads the form registry, builds the
//! Axum router and runs the HTTP listener until a shutdown signal arrives.

mod assets;
mod auth;
mod config;
mod dispatch;
mod error;
mod executor;
mod field;
mod form;
mod http;
mod logging;
mod privilege;
mod raw;
mod registry;
mod render;
mod source;
mod upload;

use axum::extract::{DefaultBodyLimit, connect_info::ConnectInfo};
use axum::http::Request;
use axum::http::header::HeaderName;
use axum::middleware;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::auth::AuthConfig;
use crate::config::Args;
use crate::executor::ExecutorConfig;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::registry::RegistrySource;
use crate::upload::UploadConfig;

shadow!(build);

/// Starts the formrun server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let source = match RegistrySource::open(&args.config_file, args.reload).await {
        Ok(source) => Arc::new(source),
        Err(err) => {
            error!(path = ?args.config_file, error = %err, "invalid form configuration");
            std::process::exit(1);
        }
    };

    let trusted_user_header = args
        .trusted_user_header
        .as_deref()
        .map(HeaderName::try_from)
        .transpose()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let auth_config = Arc::new(AuthConfig {
        trusted_user_header,
    });
    let executor_config = Arc::new(ExecutorConfig {
        default_run_as: args.default_run_as.clone(),
    });
    let upload_config = Arc::new(UploadConfig {
        temp_dir: args.upload_dir(),
    });
    tokio::fs::create_dir_all(&upload_config.temp_dir).await?;

    let body_limit = match usize::try_from(args.max_body_size) {
        Ok(0) => DefaultBodyLimit::disable(),
        Ok(limit) => DefaultBodyLimit::max(limit),
        Err(_) => DefaultBodyLimit::disable(),
    };

    let mut app = dispatch::router(source, auth_config, executor_config, upload_config)
        .layer(body_limit)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(CatchPanicLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::spawn(shutdown_signal(handle));
    server.await
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
