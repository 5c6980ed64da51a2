use std::collections::HashMap;

use fedgeo_core::{BucketId, Record};
use fedgeo_grid::GridConfig;
use fedgeo_networking::SessionId;
use fedgeo_silo::{Silo, SiloError, SiloOptions};
use fedgeo_telemetry::{TelemetryConfig, TelemetryHandle};
use pretty_assertions::assert_eq;

fn clustered_records() -> Vec<Record> {
    let mut records = Vec::new();
    let mut id = 0;
    for (cx, cy, n) in [(1.0f32, 1.0f32, 40), (9.0, 9.0, 3), (5.0, 1.0, 12)] {
        for i in 0..n {
            let jitter = (i % 7) as f32 * 0.05;
            records.push(Record::new(id, cx + jitter, cy - jitter));
            id += 1;
        }
    }
    records.push(Record::new(id, 0.0, 0.0));
    records.push(Record::new(id + 1, 10.0, 10.0));
    records
}

fn noisy_silo(seed: u8, epsilon: f64) -> Silo {
    let mut options = SiloOptions::new(
        3,
        GridConfig {
            k: 4,
            epsilon,
            noise_cap: 20,
        },
    );
    options.seed = Some([seed; 32]);
    let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("silo"));
    Silo::build(clustered_records(), options, telemetry).unwrap()
}

#[test]
fn each_bucket_releases_exactly_its_noisy_count() {
    for seed in 0..8u8 {
        let silo = noisy_silo(seed, 0.5);
        let index = silo.index();
        let buckets: Vec<BucketId> = (0..index.num_buckets() as BucketId).collect();
        let session = SessionId(u64::from(seed));
        silo.set_candidate_buckets(session, buckets.clone()).unwrap();
        let released = silo.release_candidate_records(session).unwrap();

        let expected_total: i64 = buckets
            .iter()
            .map(|id| index.perturbed_count(*id).unwrap())
            .sum();
        assert_eq!(released.len() as i64, expected_total);

        let mut genuine_per_bucket: HashMap<BucketId, usize> = HashMap::new();
        let mut dummies = 0usize;
        for record in &released {
            if record.is_dummy() {
                dummies += 1;
            } else {
                let bucket = index
                    .geometry()
                    .bucket_of([record.coord(0), record.coord(1)]);
                *genuine_per_bucket.entry(bucket).or_default() += 1;
            }
        }

        let mut expected_dummies = 0usize;
        for id in &buckets {
            let t = index.true_count(*id).unwrap();
            let n = index.perturbed_count(*id).unwrap() as usize;
            assert_eq!(
                genuine_per_bucket.get(id).copied().unwrap_or(0),
                t.min(n),
                "seed {seed} bucket {id}"
            );
            expected_dummies += n.saturating_sub(t);
        }
        assert_eq!(dummies, expected_dummies, "seed {seed}");
    }
}

#[test]
fn dummies_sit_outside_the_data_extent() {
    let silo = noisy_silo(11, 0.05);
    let geometry = silo.index().geometry().clone();
    let all: Vec<BucketId> = (0..16).collect();
    silo.set_candidate_buckets(SessionId(1), all).unwrap();
    for record in silo.release_candidate_records(SessionId(1)).unwrap() {
        if record.is_dummy() {
            assert!(record.coord(0) < geometry.min[0] - 1.0);
            assert!(record.coord(1) < geometry.min[1] - 1.0);
        }
    }
}

#[test]
fn released_records_are_genuine_snapshot_members() {
    let silo = noisy_silo(2, 1.0);
    silo.set_candidate_buckets(SessionId(9), vec![0, 5, 15]).unwrap();
    let snapshot = clustered_records();
    for record in silo.release_candidate_records(SessionId(9)).unwrap() {
        if !record.is_dummy() {
            assert!(snapshot.contains(&record));
        }
    }
}

#[test]
fn session_is_consumed_by_release() {
    let silo = noisy_silo(4, 1.0);
    silo.set_candidate_buckets(SessionId(5), vec![1]).unwrap();
    silo.release_candidate_records(SessionId(5)).unwrap();
    assert!(matches!(
        silo.release_candidate_records(SessionId(5)),
        Err(SiloError::UnknownSession(SessionId(5)))
    ));
    assert_eq!(silo.open_sessions(), 0);
}
