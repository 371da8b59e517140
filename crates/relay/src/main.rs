mod api;
mod auth;
mod config;
mod cors;
mod error;
mod metrics;
mod request_id;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::{Parser, Subcommand};
use courier_common::types::UserId;
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::{jwt::JwtIdentityVerifier, IdentityVerifier},
    config::RelayConfig,
    error::RelayError,
    metrics::RelayMetrics,
    ws::{registry::ConnectionRegistry, session::SessionSettings, ChatState},
};

#[derive(Debug, Parser)]
#[command(name = "courier-relay", version, about = "Real-time chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server (default).
    Serve,
    /// Mint a development access token for a user id.
    Token {
        #[arg(value_name = "USER_ID")]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Token { user_id } => {
            let verifier = JwtIdentityVerifier::new(&config.jwt_secret)
                .context("invalid relay JWT secret")?;
            println!("{}", verifier.issue_token(UserId(user_id))?);
            Ok(())
        }
    }
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set COURIER_RELAY_JWT_SECRET in production");
    }

    let verifier: Arc<dyn IdentityVerifier> = Arc::new(
        JwtIdentityVerifier::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    let registry = Arc::new(ConnectionRegistry::new(config.send_timeout));
    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let chat = ChatState {
        registry: Arc::clone(&registry),
        verifier: Arc::clone(&verifier),
        settings: SessionSettings::from_config(&config),
    };
    let app = build_router(chat, relay_metrics, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn build_router(chat: ChatState, relay_metrics: Arc<RelayMetrics>, cors_origins: Option<&str>) -> Router {
    let api_router =
        api::router(Arc::clone(&chat.registry), relay_metrics, Arc::clone(&chat.verifier));

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(chat))
            .merge(api_router)
            .fallback(not_found),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn not_found() -> Response {
    RelayError::NotFound.into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::Internal.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id::from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = request_id::scope(request_id.clone(), next.run(request)).await;
    request_id::attach_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
