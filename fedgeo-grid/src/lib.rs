//! Static uniform grid index used by every silo. The grid is built once per
//! dataset snapshot; afterwards only the published (noisy) bucket counts
//! change, and only through [`GridIndex::perturb_counts`].
//!
//! # Quickstart
//! ```
//! use fedgeo_core::{Circle, Record};
//! use fedgeo_grid::GridIndex;
//!
//! let records = vec![Record::new(0, 0.0, 0.0), Record::new(1, 10.0, 10.0)];
//! let index = GridIndex::build(records, 4).unwrap();
//! assert_eq!(index.num_buckets(), 16);
//! assert_eq!(index.range_query(&Circle::new(0.0, 0.0, 1.0)).len(), 1);
//! ```

mod geometry;
mod index;

pub use geometry::{GridGeometry, DIMS};
pub use index::{GridIndex, IndexStats};

use fedgeo_dp::DpError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("grid needs between 1 and 65535 cells per dimension (got {0})")]
    InvalidK(u32),
    #[error("{0} records exceed the index capacity")]
    TooManyRecords(usize),
    #[error("noise cap must be non-negative (got {0})")]
    InvalidNoiseCap(i64),
    #[error(transparent)]
    Noise(#[from] DpError),
}

/// Index parameters as they appear in a silo configuration file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GridConfig {
    /// Cells per dimension.
    #[serde(default = "default_k")]
    pub k: u32,
    /// Budget spent on the whole count vector; each bucket gets `epsilon / K^d`.
    pub epsilon: f64,
    /// Bound on the magnitude of the noise added to one bucket.
    #[serde(default = "default_noise_cap")]
    pub noise_cap: i64,
}

const fn default_k() -> u32 {
    10
}

const fn default_noise_cap() -> i64 {
    100
}

impl GridConfig {
    pub fn sample() -> Self {
        Self {
            k: default_k(),
            epsilon: 1.0,
            noise_cap: default_noise_cap(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 || self.k > u16::MAX as u32 {
            return Err(format!("grid k must lie within 1..=65535 (got {})", self.k));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(format!("grid epsilon must be > 0 (got {})", self.epsilon));
        }
        if self.noise_cap < 0 {
            return Err(format!("noise cap must be >= 0 (got {})", self.noise_cap));
        }
        Ok(())
    }
}
