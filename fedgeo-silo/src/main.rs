mod config;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use config::{load_config, ConfigError, ConfigFormat};
use fedgeo_core::load_records;
use fedgeo_networking::{serve, JsonCodec, RequestHandler, WireCodec};
use fedgeo_silo::{Silo, SiloService};
use fedgeo_telemetry::TelemetryHandle;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!("Only one of the `dev`, `test`, or `prod` features may be enabled for fedgeo-silo.");

#[derive(Debug, Parser)]
#[command(
    name = "fedgeo-silo",
    version,
    about = "Data silo answering federated private range queries"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/silo-0.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Override the silo id defined in the config file.
    #[arg(long)]
    id: Option<u32>,
    /// Override the listen address defined in the config file.
    #[arg(long, env = "FEDGEO_SILO_LISTEN")]
    listen: Option<String>,
    /// Override the record file defined in the config file.
    #[arg(long)]
    data: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = load_config(&cli.config, cli.config_format)?;
    if let Some(id) = cli.id {
        config.silo.id = id;
    }
    if let Some(listen) = cli.listen {
        config.silo.listen = listen;
    }
    if let Some(data) = cli.data {
        config.silo.data_path = data;
    }
    config.validate().map_err(|err| match err {
        ConfigError::Validation(reason) => eyre!(reason),
        other => other.into(),
    })?;

    let records = load_records(&config.silo.data_path)?;
    let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
    let silo = Arc::new(Silo::build(records, config.silo_options()?, telemetry.clone())?);
    let handler: Arc<dyn RequestHandler> = Arc::new(SiloService::new(Arc::clone(&silo)));
    let codec: Arc<dyn WireCodec> = Arc::new(JsonCodec);

    let flusher = tokio::spawn(flush_telemetry(telemetry.clone()));
    let listener = TcpListener::bind(&config.silo.listen).await?;
    serve(
        listener,
        handler,
        codec,
        config.networking.max_frame_bytes,
        async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
    )
    .await?;
    flusher.abort();

    let snapshot = telemetry.flush();
    info!(
        counters = ?snapshot.counters,
        latencies = ?snapshot.latencies,
        "final telemetry snapshot"
    );
    println!("silo {}\n{}", silo.id(), silo.query_log().summary());
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn flush_telemetry(telemetry: TelemetryHandle) {
    let period = Duration::from_millis(telemetry.flush_interval_ms().max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = telemetry.flush();
        info!(
            counters = ?snapshot.counters,
            latencies = ?snapshot.latencies,
            labels = ?snapshot.labels,
            "telemetry snapshot"
        );
    }
}
