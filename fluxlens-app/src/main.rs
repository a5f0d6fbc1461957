use axum::http::header;
use axum::middleware::map_response;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use clap::{Parser, Subcommand};
use fluxlens_core::aggregator::{AggregatorOptions, ServiceAggregator};
use fluxlens_core::errors::FluxLensError;
use fluxlens_core::events::NotificationTracker;
use fluxlens_core::flux_resource::FluxResourceKind;
use fluxlens_core::flux_state::list_flux_kind;
use fluxlens_core::kube_client::{KubeClient, KubeClientImpl};
use fluxlens_core::logs::LogRegistry;
use fluxlens_core::reconcile::{Orchestrator, OrchestratorConfig};
use fluxlens_core::snapshot::{export_snapshot_dir, SnapshotKubeClient};
use fluxlens_core::store::actor::StoreHandle;
use fluxlens_core::store::ServiceStore;
use fluxlens_core::types::ManagedService;
use fluxlens_core::watch::{spawn_watchers, ServiceAdmission};
use kube::config::KubeConfigOptions;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::propagate_header::PropagateHeaderLayer;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace;
use tracing::{info, warn};

pub mod errors;
pub mod logger;
mod routes;

shadow!(build);

#[derive(Parser)]
#[command(name = "fluxlens-app")]
#[command(about = "Dashboard backend for Flux managed services", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[arg(long, env = "KUBE_CONTEXT")]
    kube_context: Option<String>,
    #[arg(long, env = "KUBE_NAMESPACE")]
    kube_namespace: Option<String>,
    #[arg(long, env = "HTTP_HOST", default_value = "127.0.0.1")]
    http_host: String,
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,
    /// Serve a directory written by `snapshot export` instead of a live cluster.
    #[arg(long, env = "KUBE_SNAPSHOT_DIR")]
    snapshot_dir: Option<String>,
    /// Report a Service listed by both a Kustomization and a HelmRelease once.
    #[arg(long, env = "MERGE_DUPLICATE_SOURCES")]
    merge_duplicate_sources: bool,
    #[arg(long, env = "RECONCILE_TIMEOUT_SECONDS", default_value_t = 300)]
    reconcile_timeout_seconds: u64,
    #[arg(long, env = "RECONCILE_POLL_INTERVAL_SECONDS", default_value_t = 2)]
    reconcile_poll_interval_seconds: u64,
}

#[derive(Subcommand)]
enum Command {
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    Export {
        #[arg(long, env = "SNAPSHOT_EXPORT_DIR")]
        output_dir: String,
    },
}

pub const APP_VERSION: &str = shadow_rs::formatcp!(
    "{} ({} {}), build_env: {}, {}, {}",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL,
    build::CARGO_VERSION
);

async fn set_version_header<B>(mut res: Response<B>) -> Response<B> {
    match APP_VERSION.parse() {
        Ok(value) => {
            res.headers_mut().insert("x-version-id", value);
        }
        Err(err) => {
            warn!("Failed to parse x-version-id header value: {err}");
        }
    }
    res
}

async fn initial_services(
    client: &dyn KubeClient,
    namespace: Option<&str>,
    options: AggregatorOptions,
) -> fluxlens_core::Result<Vec<ManagedService>> {
    let kustomizations = list_flux_kind(client, FluxResourceKind::Kustomization, namespace).await?;
    let helm_releases = list_flux_kind(client, FluxResourceKind::HelmRelease, namespace).await?;
    ServiceAggregator::new(client, options)
        .aggregate(&kustomizations, &helm_releases)
        .await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> errors::Result<()> {
    logger::setup("fluxlens_app", "INFO");

    let cli = Cli::parse();

    let kube_context: Option<String> = cli.kube_context;
    let kube_namespace: Option<String> = cli.kube_namespace;
    info!("KUBE_CONTEXT: {kube_context:?}, KUBE_NAMESPACE: {kube_namespace:?}");

    let kube_opts = KubeConfigOptions {
        context: kube_context,
        cluster: None,
        user: None,
    };

    if let Some(Command::Snapshot {
        command: SnapshotCommand::Export { output_dir },
    }) = cli.command
    {
        let client = KubeClientImpl::new(&kube_opts, kube_namespace.as_deref()).await?;
        export_snapshot_dir(&client, Path::new(&output_dir), kube_namespace.as_deref()).await?;
        info!("Snapshot export complete");
        return Ok(());
    }

    let token: CancellationToken = CancellationToken::new();
    let aggregator_options = AggregatorOptions {
        merge_duplicate_sources: cli.merge_duplicate_sources,
    };
    let orchestrator_config = OrchestratorConfig {
        timeout: Duration::from_secs(cli.reconcile_timeout_seconds),
        poll_interval: Duration::from_secs(cli.reconcile_poll_interval_seconds),
        ..Default::default()
    };

    let (client, orchestrator, store, watchers): (Arc<dyn KubeClient>, _, _, _) =
        if let Some(snapshot_dir) = cli.snapshot_dir {
            info!("Loading snapshot from directory: {snapshot_dir}");
            let snapshot_client = Arc::new(
                SnapshotKubeClient::from_dir(&snapshot_dir)?
                    .with_default_namespace(kube_namespace.as_deref()),
            );
            let services =
                initial_services(snapshot_client.as_ref(), None, aggregator_options).await?;
            let store = StoreHandle::spawn("services", ServiceStore::seeded(services));
            (snapshot_client as Arc<dyn KubeClient>, None, store, Vec::new())
        } else {
            let kube_client =
                Arc::new(KubeClientImpl::new(&kube_opts, kube_namespace.as_deref()).await?);
            let services =
                initial_services(kube_client.as_ref(), None, aggregator_options).await?;
            let admission = ServiceAdmission::new(services.iter().filter_map(ManagedService::key));
            let store = StoreHandle::spawn("services", ServiceStore::seeded(services));
            let watchers = spawn_watchers(
                kube_client.client(),
                kube_namespace.as_deref(),
                store.clone(),
                admission,
                token.clone(),
            );
            let orchestrator = Arc::new(Orchestrator::new(kube_client.clone(), orchestrator_config));
            (kube_client as Arc<dyn KubeClient>, Some(orchestrator), store, watchers)
        };

    let logs = Arc::new(LogRegistry::new(client.clone()));
    let state = routes::AppState {
        client,
        namespace: kube_namespace,
        store: store.clone(),
        orchestrator,
        logs: logs.clone(),
        notifications: Arc::new(Mutex::new(NotificationTracker::new(Utc::now()))),
    };

    let main_router = routes::create_route(state);
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
    let route = Router::new()
        .merge(main_router)
        .route(
            "/render/metrics",
            get(|| async move { metric_handle.render() }),
        )
        .layer(prometheus_layer)
        .layer(map_response(set_version_header))
        // High level logging of requests and responses
        .layer(
            trace::TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().include_headers(true))
                .on_request(trace::DefaultOnRequest::new().level(tracing::Level::DEBUG))
                .on_response(trace::DefaultOnResponse::new().level(tracing::Level::DEBUG)),
        )
        // Mark the `Authorization` request header as sensitive, so it doesn't
        // show in logs.
        .layer(SetSensitiveHeadersLayer::new(std::iter::once(
            header::AUTHORIZATION,
        )))
        // Compress responses
        .layer(CompressionLayer::new())
        // Propagate `x-request-id`s from requests to responses
        .layer(PropagateHeaderLayer::new(header::HeaderName::from_static(
            "x-request-id",
        )))
        // CORS configuration. This should probably be more restrictive in
        // production.
        .layer(CorsLayer::permissive());

    let http_addr: SocketAddr = format!("{}:{}", cli.http_host, cli.http_port)
        .parse()
        .map_err(|err| {
            FluxLensError::from(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
        })?;
    let svc = route.into_make_service_with_connect_info::<SocketAddr>();
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(FluxLensError::from)?;
    let shutdown_token = token.clone();
    let f: tokio::task::JoinHandle<errors::Result<()>> = tokio::spawn(async move {
        axum::serve(http_listener, svc)
            .with_graceful_shutdown(shutdown_signal(shutdown_token))
            .await
            .map_err(|err| FluxLensError::from(std::io::Error::other(err)))?;
        Ok(())
    });

    info!("FluxLens is running on http://{http_addr}, metrics on http://{http_addr}/render/metrics");

    f.await
        .map_err(|err| FluxLensError::from(std::io::Error::other(err)))??;

    token.cancel();
    for watcher in watchers {
        if let Err(err) = watcher.await {
            warn!("Watcher task failed: {err}");
        }
    }
    logs.stop_all();
    store.shutdown().await;
    info!("Server shutdown");

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install signal handler: {err}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            token.cancel()
        },
        _ = terminate => {
            token.cancel()
        },
    }

    info!("signal received, starting graceful shutdown");
}
