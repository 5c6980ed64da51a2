mod config;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use config::{load_config, ConfigError, ConfigFormat};
use fedgeo_coordinator::{Coordinator, QueryMode};
use fedgeo_core::load_queries;
use fedgeo_networking::SiloClient;
use fedgeo_telemetry::TelemetryHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for fedgeo-coordinator."
);

#[derive(Debug, Parser)]
#[command(
    name = "fedgeo-coordinator",
    version,
    about = "Runs a query file through the federated private range-query protocol"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/coordinator.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Override the query file defined in the config file.
    #[arg(long)]
    queries: Option<PathBuf>,
    /// Override the silo address file defined in the config file.
    #[arg(long)]
    silo_file: Option<PathBuf>,
    /// Override the spatial epsilon defined in the config file.
    #[arg(long)]
    epsilon_spatial: Option<f64>,
    /// Ask silos for exact answers instead of running the protocol.
    #[arg(long)]
    baseline: bool,
    /// Fetch candidate records encrypted under each silo's key.
    #[arg(long)]
    encrypt: bool,
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
    if let Some(queries) = cli.queries {
        config.coordinator.query_path = queries;
    }
    if let Some(silo_file) = cli.silo_file {
        config.coordinator.silos.clear();
        config.coordinator.silo_file = Some(silo_file);
    }
    if let Some(epsilon) = cli.epsilon_spatial {
        config.protocol.epsilon_spatial = epsilon;
    }
    if cli.baseline {
        config.protocol.mode = QueryMode::Baseline;
    }
    if cli.encrypt {
        config.protocol.encrypt_records = true;
    }
    config.validate().map_err(|err| match err {
        ConfigError::Validation(reason) => eyre!(reason),
        other => other.into(),
    })?;

    let clients = config
        .endpoints()?
        .into_iter()
        .map(|endpoint| SiloClient::tcp(endpoint.id, endpoint.address, &config.networking))
        .collect();
    let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
    let coordinator = Coordinator::new(
        clients,
        config.protocol.clone(),
        config.seed()?,
        telemetry.clone(),
    )?;

    let queries = load_queries(&config.coordinator.query_path)?;
    info!(queries = queries.len(), "query file loaded");
    let mut failed = 0usize;
    for (qid, query) in queries.iter().enumerate() {
        match coordinator.run(query).await {
            Ok(answer) => {
                println!("{qid} {} {}", answer.count, answer.candidates);
                let ids: Vec<String> = answer.ids().iter().map(i32::to_string).collect();
                println!("{}", ids.join(" "));
            }
            Err(err) => {
                failed += 1;
                error!(
                    qid,
                    stage = ?err.stage(),
                    silo = ?err.silo(),
                    error = %err,
                    "query failed"
                );
            }
        }
    }

    let snapshot = telemetry.flush();
    info!(
        counters = ?snapshot.counters,
        latencies = ?snapshot.latencies,
        "final telemetry snapshot"
    );
    println!("{}", coordinator.query_log().summary());
    if failed > 0 {
        return Err(eyre!("{failed} of {} queries failed", queries.len()));
    }
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
