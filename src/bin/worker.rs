//! Worker dispatcher HTTP entrypoint: the expensive tier that holds
//! every collaborator and serves the full HTTP surface. Uses the same
//! `GenerateConfig`/`Start` CLI shape as the scout, extended with a
//! scheduling-mode choice between scheduler-driven (default) and continuous.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use ev_charge_control::config::Config;
use ev_charge_control::offpeak::OffPeakReconciler;
use ev_charge_control::pricing::HttpPlanClient;
use ev_charge_control::proxy::ProxySupervisor;
use ev_charge_control::sheet::HttpSheetClient;
use ev_charge_control::special::session::SessionApplier;
use ev_charge_control::special::SpecialChargingPlanner;
use ev_charge_control::state_store::JsonFileStateStore;
use ev_charge_control::tokens::{FileSecretStore, TokenWriter};
use ev_charge_control::vehicle::{TokenExchange, VehicleGateway};
use ev_charge_control::worker::{router, run_continuous_scheduler, AppState, WorkerMode};
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
    /// Run the Worker dispatcher HTTP service.
    Start {
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
        #[structopt(short, long, default_value = "0.0.0.0:8080")]
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

type AppStoreState = AppState<JsonFileStateStore, FileSecretStore>;

async fn build_app_state(config: Config) -> Result<AppStoreState> {
    let vin = config.vehicle_credentials.vin.clone();

    let gateway = Arc::new(VehicleGateway::new("ev-charge-control-worker/0.1"));

    let state_store = Arc::new(
        JsonFileStateStore::open(PathBuf::from(&config.storage.state_store_path)).await?,
    );

    let secret_store = Arc::new(FileSecretStore::new(
        PathBuf::from(&config.storage.token_store_path),
        None,
    ));
    let exchange = TokenExchange::new(
        config.vehicle_credentials.client_id.clone(),
        config.vehicle_credentials.client_secret.clone(),
    );
    let token_writer = Arc::new(TokenWriter::new(
        secret_store,
        exchange,
        PathBuf::from(&config.storage.token_store_path).with_extension("local.json"),
    ));

    let proxy = Arc::new(ProxySupervisor::new(
        PathBuf::from(&config.proxy.private_key_path),
        PathBuf::from(&config.storage.proxy_binary_path),
        config.proxy.proxy_host.clone(),
        config.proxy.proxy_port,
        PathBuf::from(&config.storage.proxy_tls_dir),
    ));

    let plan_client = Arc::new(HttpPlanClient::new(
        config.pricing.base_url.clone(),
        config.pricing.api_key.clone(),
    ));
    let offpeak = Arc::new(OffPeakReconciler {
        gateway: gateway.clone(),
        proxy: proxy.clone(),
        plan_client,
        state_store: state_store.clone(),
        home: config.home.clone(),
        charging: config.charging.clone(),
        proxy_config: config.proxy.clone(),
    });

    let sheet = Arc::new(HttpSheetClient::new(
        config.sheet.base_url.clone(),
        config.sheet.api_key.clone(),
    ));
    let jobs = Arc::new(ev_charge_control::jobs::HttpJobRegistrar::new(
        config.jobs.base_url.clone(),
        config.jobs.api_key.clone(),
    ));
    let applier = SessionApplier {
        gateway: gateway.clone(),
        proxy: proxy.clone(),
        state_store: state_store.clone(),
        home: config.home.clone(),
    };
    let special = Arc::new(SpecialChargingPlanner {
        sheet,
        jobs,
        state_store: state_store.clone(),
        applier,
        home: config.home.clone(),
        charging: config.charging.clone(),
        special: config.special.clone(),
        worker_service_url: config.worker.worker_service_url.clone(),
    });

    Ok(AppState::new(
        config,
        vin,
        gateway,
        token_writer,
        proxy,
        state_store,
        offpeak,
        special,
    ))
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

            let continuous_mode = config.worker.continuous_mode;
            let state = build_app_state(config).await?;

            let shutdown = CancellationToken::new();
            if continuous_mode {
                let mode = Arc::new(RwLock::new(WorkerMode::Running));
                let scheduler_state = state.clone();
                let scheduler_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_continuous_scheduler(scheduler_state, mode, scheduler_shutdown).await;
                });
                tracing::info!("continuous scheduling mode enabled");
            } else {
                tracing::info!("scheduler-driven mode: waiting for external /run-cycle calls");
            }

            let app = router::<JsonFileStateStore, FileSecretStore>().with_state(state);

            tracing::info!(%address, "starting worker dispatcher");
            let listener = tokio::net::TcpListener::bind(address).await?;
            let serve_shutdown = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::signal::ctrl_c().await.ok();
                    serve_shutdown.cancel();
                })
                .await?;
            Ok(())
        }
    }
}
