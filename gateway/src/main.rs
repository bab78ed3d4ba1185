use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use pulse_internal::auth::resolve_identity;
use pulse_internal::config::Config;
use pulse_internal::endpoints;
use pulse_internal::endpoints::status::PULSE_VERSION;
use pulse_internal::error;
use pulse_internal::gateway_util::AppStateData;
use pulse_internal::observability::{self, LogFormat};
use pulse_internal::quota::quota_gate_middleware;
use pulse_internal::sweeper::Sweeper;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `pulse.toml` config file at the specified path. Incompatible with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use a default config file. Incompatible with `--config-file`
    #[arg(long)]
    default_config: bool,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

async fn add_version_header(request: Request, next: Next) -> Response {
    let version = HeaderValue::from_static(PULSE_VERSION);
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-pulse-gateway-version", version);
    response
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`.
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting Pulse Gateway {PULSE_VERSION}");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = if let Some(path) = &args.config_file {
        Arc::new(
            Config::load_and_verify_from_path(Path::new(&path))
                .await
                .ok() // Don't print the error here, since it was already printed when it was constructed
                .expect_pretty("Failed to load config"),
        )
    } else {
        if !args.default_config {
            tracing::warn!("Running the gateway without any config-related arguments is deprecated. Use `--default-config` to start the gateway with the default config.");
        }
        Arc::new(Config::default())
    };

    // Set debug mode
    error::set_debug(config.gateway.debug).expect_pretty("Failed to set debug mode");

    // Initialize AppState
    let app_state = AppStateData::new(config.clone())
        .await
        .expect_pretty("Failed to initialize AppState");

    let authentication_enabled_pretty = if app_state.auth.enabled() {
        "enabled"
    } else {
        "disabled"
    };

    // Billable routes: identity resolution, then the quota gate, then the
    // handler, which records usage once the action succeeds.
    // Note: In Axum, middleware layers run in REVERSE order of application
    let billable_routes = Router::new()
        .route(
            "/v1/analysis/profile",
            post(endpoints::analysis::analysis_handler),
        )
        .route("/v1/generate/post", post(endpoints::generate::post_handler))
        .route(
            "/v1/generate/comment",
            post(endpoints::generate::comment_handler),
        )
        .route("/v1/generate/idea", post(endpoints::generate::idea_handler))
        .layer(axum::middleware::from_fn_with_state(
            app_state.evaluator.clone(),
            quota_gate_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            app_state.auth.clone(),
            resolve_identity,
        ));

    // Account routes resolve an identity but spend nothing.
    let account_routes = Router::new()
        .route(
            "/v1/subscription",
            get(endpoints::subscription::get_subscription_handler),
        )
        .route(
            "/v1/subscription/usage",
            get(endpoints::subscription::usage_handler),
        )
        .route(
            "/v1/subscription/cancel",
            post(endpoints::subscription::cancel_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            app_state.auth.clone(),
            resolve_identity,
        ));

    // Routes that don't require authentication
    let public_routes = Router::new()
        .route(
            "/v1/webhooks/payment",
            post(endpoints::webhook::payment_webhook_handler),
        )
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        );

    let router = Router::new()
        .merge(billable_routes)
        .merge(account_routes)
        .merge(public_routes)
        .fallback(endpoints::fallback::handle_404)
        .layer(axum::middleware::from_fn(add_version_header))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // profiles and prompts stay small
        // We log failed requests at 'DEBUG', since we already have our own error-logging code
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state.clone());

    if config.sweep.enabled {
        let sweeper = Arc::new(Sweeper::new(
            app_state.accounts.clone(),
            app_state.notifier.clone(),
            app_state.policy.clone(),
            config.trial.reminder_window(),
        ));
        sweeper.spawn(Duration::from_secs(config.sweep.interval_secs));
    } else {
        tracing::warn!("Subscription sweep disabled: trials will not expire on their own");
    }

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    let config_path_pretty = if let Some(path) = &args.config_file {
        format!("config file `{}`", path.to_string_lossy())
    } else {
        "no config file".to_string()
    };

    tracing::info!(
        "Pulse Gateway is listening on {actual_bind_address} with {config_path_pretty} and authentication {authentication_enabled_pretty}.",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = hangup => {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// We use `expect_pretty` for better DX when handling errors in main.rs.
/// `expect_pretty` will print an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
