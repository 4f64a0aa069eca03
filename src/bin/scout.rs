//! Scout sampler HTTP entrypoint: a thin, cheap always-on service that
//! samples the vehicle and asks the worker to act when the condition table
//! says so. Uses the familiar `GenerateConfig`/`Start` CLI shape (TOML
//! config, optional Prometheus endpoint).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use structopt::StructOpt;
use tower_http::trace::TraceLayer;

use ev_charge_control::config::Config;
use ev_charge_control::scout::{CacheStats, Scout, ScoutResponse};
use ev_charge_control::state_store::JsonFileStateStore;
use ev_charge_control::tokens::{FileSecretStore, TokenReader};
use ev_charge_control::vehicle::VehicleGateway;
use ev_charge_control::Validate;

#[derive(Debug, StructOpt)]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Generate a default configuration file.
    GenerateConfig {
        #[structopt(short, long, parse(from_os_str))]
        output: PathBuf,
    },
    /// Run the Scout sampler HTTP service.
    Start {
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
        #[structopt(short, long, default_value = "0.0.0.0:8081")]
        address: SocketAddr,
        #[structopt(long)]
        prometheus_endpoint: Option<SocketAddr>,
    },
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = toml::from_str(&data).context("parsing config file")?;
    config.validate().context("validating config")
}

type AppScout = Scout<JsonFileStateStore, FileSecretStore>;

#[derive(Clone)]
struct ScoutState {
    scout: Arc<AppScout>,
    vin: String,
}

#[derive(serde::Deserialize)]
struct TriggerQuery {
    action: Option<String>,
}

async fn root(
    State(state): State<ScoutState>,
    Query(query): Query<TriggerQuery>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    if query.action.as_deref() == Some("cache-stats") {
        let stats: CacheStats = state.scout.cache_stats().await;
        return Json(stats).into_response();
    }
    match state.scout.sample(&state.vin).await {
        Ok(resp) => Json::<ScoutResponse>(resp).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "scout sample failed");
            (
                axum::http::StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"status": "error", "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn cache_stats(State(state): State<ScoutState>) -> Json<CacheStats> {
    Json(state.scout.cache_stats().await)
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();

    match opt.cmd {
        Command::GenerateConfig { output } => {
            let config = Config::default();
            let toml = toml::to_string_pretty(&config)?;
            std::fs::write(&output, toml)
                .with_context(|| format!("writing default config to {}", output.display()))?;
            println!("wrote default config to {}", output.display());
            Ok(())
        }
        Command::Start {
            config,
            address,
            prometheus_endpoint,
        } => {
            let config = load_config(&config)?;

            if let Some(prom_addr) = prometheus_endpoint {
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .listen_address(prom_addr)
                    .install()
                    .context("installing Prometheus exporter")?;
            }

            let gateway = Arc::new(VehicleGateway::new("ev-charge-control-scout/0.1"));
            let state_store = Arc::new(
                JsonFileStateStore::open(PathBuf::from(&config.storage.state_store_path)).await?,
            );
            let secret_store = Arc::new(FileSecretStore::new(
                PathBuf::from(&config.storage.token_store_path),
                None,
            ));
            let token_reader = Arc::new(TokenReader::new(secret_store));

            let scout = Arc::new(Scout::new(
                gateway,
                state_store,
                token_reader,
                config.home.clone(),
                config.worker.worker_service_url.clone(),
                "ev-charge-control-scout/0.1".to_string(),
                PathBuf::from(&config.storage.scout_rate_limit_path),
            ));

            let state = ScoutState {
                scout,
                vin: config.vehicle_credentials.vin.clone(),
            };

            let app = Router::new()
                .route("/", post(root).get(root))
                .route("/health", get(health))
                .route("/cache-stats", get(cache_stats))
                .layer(TraceLayer::new_for_http())
                .with_state(state);

            tracing::info!(%address, "starting scout sampler");
            let listener = tokio::net::TcpListener::bind(address).await?;
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}
