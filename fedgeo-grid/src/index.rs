use std::{mem, sync::Arc, time::Instant};

use fedgeo_core::{BucketId, Circle, Record, Rectangle};
use fedgeo_dp::NoiseSampler;
use tracing::{debug, info};

use crate::{
    geometry::{GridGeometry, DIMS},
    GridError,
};

/// Size and timing figures gathered while building an index.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IndexStats {
    pub records: usize,
    pub buckets: usize,
    pub approx_bytes: usize,
    pub build_micros: u128,
}

/// Static uniform grid over a snapshot of records. Buckets hold positions
/// into the shared snapshot; the snapshot itself is never copied.
#[derive(Clone, Debug)]
pub struct GridIndex {
    geometry: GridGeometry,
    records: Arc<[Record]>,
    buckets: Vec<Vec<u32>>,
    noisy_counts: Vec<i64>,
    stats: IndexStats,
}

impl GridIndex {
    pub fn build(records: impl Into<Arc<[Record]>>, k: u32) -> Result<Self, GridError> {
        let started = Instant::now();
        let records: Arc<[Record]> = records.into();
        if k == 0 || k > u16::MAX as u32 {
            return Err(GridError::InvalidK(k));
        }
        if records.len() > u32::MAX as usize {
            return Err(GridError::TooManyRecords(records.len()));
        }

        let (min, max) = bounds(&records);
        let geometry = GridGeometry::new(k, min, max);
        let mut buckets = vec![Vec::new(); geometry.num_buckets()];
        for (pos, record) in records.iter().enumerate() {
            let id = geometry.bucket_of(std::array::from_fn(|dim| record.coord(dim)));
            buckets[id as usize].push(pos as u32);
        }
        let noisy_counts = buckets.iter().map(|b| b.len() as i64).collect();

        let approx_bytes = mem::size_of::<Record>() * records.len()
            + mem::size_of::<u32>() * records.len()
            + (mem::size_of::<Vec<u32>>() + mem::size_of::<i64>()) * buckets.len();
        let stats = IndexStats {
            records: records.len(),
            buckets: buckets.len(),
            approx_bytes,
            build_micros: started.elapsed().as_micros(),
        };
        info!(
            k,
            records = stats.records,
            buckets = stats.buckets,
            approx_bytes = stats.approx_bytes,
            build_micros = stats.build_micros as u64,
            "grid index built"
        );

        Ok(Self {
            geometry,
            records,
            buckets,
            noisy_counts,
            stats,
        })
    }

    /// Replace every published count with
    /// `max(0, true + clamp(IntegerLaplace(1, epsilon / K^d), -cap, cap))`.
    pub fn perturb_counts(
        &mut self,
        epsilon: f64,
        noise_cap: i64,
        sampler: &mut NoiseSampler,
    ) -> Result<(), GridError> {
        if noise_cap < 0 {
            return Err(GridError::InvalidNoiseCap(noise_cap));
        }
        let per_bucket_epsilon = epsilon / self.buckets.len() as f64;
        for (bucket, noisy) in self.buckets.iter().zip(self.noisy_counts.iter_mut()) {
            let noise = sampler
                .integer_laplace(1.0, per_bucket_epsilon)?
                .clamp(-noise_cap, noise_cap);
            *noisy = (bucket.len() as i64 + noise).max(0);
        }
        debug!(
            epsilon,
            per_bucket_epsilon,
            noise_cap,
            published = self.noisy_counts.iter().sum::<i64>(),
            actual = self.records.len(),
            "grid counts perturbed"
        );
        Ok(())
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    pub fn records(&self) -> &Arc<[Record]> {
        &self.records
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn noisy_counts(&self) -> &[i64] {
        &self.noisy_counts
    }

    pub fn true_count(&self, id: BucketId) -> Option<usize> {
        self.buckets.get(id as usize).map(Vec::len)
    }

    pub fn perturbed_count(&self, id: BucketId) -> Option<i64> {
        self.noisy_counts.get(id as usize).copied()
    }

    pub fn bucket_records(&self, id: BucketId) -> Option<impl Iterator<Item = &Record> + '_> {
        let bucket = self.buckets.get(id as usize)?;
        Some(bucket.iter().map(|pos| &self.records[*pos as usize]))
    }

    /// Exact circle range query over the buckets its bounding box touches.
    pub fn range_query(&self, circle: &Circle) -> Vec<Record> {
        self.scan(&circle.bounding_box(), |record| circle.contains_record(record))
    }

    pub fn range_query_rect(&self, rect: &Rectangle) -> Vec<Record> {
        self.scan(rect, |record| rect.contains_record(record))
    }

    fn scan(&self, bbox: &Rectangle, keep: impl Fn(&Record) -> bool) -> Vec<Record> {
        if self.records.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for interval in self.geometry.bucket_intervals(bbox) {
            for id in interval {
                for pos in &self.buckets[id as usize] {
                    let record = &self.records[*pos as usize];
                    if keep(record) {
                        out.push(*record);
                    }
                }
            }
        }
        out
    }
}

fn bounds(records: &[Record]) -> ([f64; DIMS], [f64; DIMS]) {
    if records.is_empty() {
        return ([0.0; DIMS], [0.0; DIMS]);
    }
    let mut min = [f64::INFINITY; DIMS];
    let mut max = [f64::NEG_INFINITY; DIMS];
    for record in records {
        for dim in 0..DIMS {
            min[dim] = min[dim].min(record.coord(dim));
            max[dim] = max[dim].max(record.coord(dim));
        }
    }
    (min, max)
}
