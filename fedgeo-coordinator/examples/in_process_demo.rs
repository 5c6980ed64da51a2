//! Three in-process silos over a synthetic dataset, one circle and one
//! rectangle query, federated answers printed next to the exact ones.
//!
//! ```text
//! cargo run -p fedgeo-coordinator --example in_process_demo
//! ```

use std::sync::Arc;

use color_eyre::Result;
use fedgeo_coordinator::{Coordinator, ProtocolConfig, QueryMode};
use fedgeo_core::{Record, SpatialQuery};
use fedgeo_grid::GridConfig;
use fedgeo_networking::{NetworkingConfig, SiloClient};
use fedgeo_silo::{Silo, SiloOptions, SiloService};
use fedgeo_telemetry::{TelemetryConfig, TelemetryHandle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

fn clients(silos: &[Arc<Silo>]) -> Vec<SiloClient> {
    silos
        .iter()
        .map(|silo| {
            SiloClient::in_process(
                silo.id(),
                Arc::new(SiloService::new(Arc::clone(silo))),
                &NetworkingConfig::sample(),
            )
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .init();

    let mut rng = ChaCha20Rng::seed_from_u64(2024);
    let mut silos = Vec::new();
    for id in 0..3u32 {
        let records: Vec<Record> = (0..2_000)
            .map(|i| Record::new(i, rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0)))
            .collect();
        let mut options = SiloOptions::new(id, GridConfig::sample());
        options.seed = Some([id as u8; 32]);
        let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("silo"));
        silos.push(Arc::new(Silo::build(records, options, telemetry)?));
    }

    let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("coordinator"));
    let federated = Coordinator::new(
        clients(&silos),
        ProtocolConfig::sample(),
        Some([7u8; 32]),
        telemetry.clone(),
    )?;
    let baseline = Coordinator::new(
        clients(&silos),
        ProtocolConfig {
            mode: QueryMode::Baseline,
            ..ProtocolConfig::sample()
        },
        None,
        telemetry,
    )?;

    for query in [
        SpatialQuery::range_circle(50.0, 50.0, 8.0),
        SpatialQuery::range_rectangle(20.0, 70.0, 5.0, 10.0),
    ] {
        let exact = baseline.run(&query).await?;
        let answer = federated.run(&query).await?;
        println!(
            "{:?}: exact={} federated={} candidates={} dummies={} false_positives={} bytes={}",
            query.shape,
            exact.count,
            answer.count,
            answer.candidates,
            answer.dummies,
            answer.false_positives,
            answer.bytes
        );
    }
    println!("{}", federated.query_log().summary());
    Ok(())
}
