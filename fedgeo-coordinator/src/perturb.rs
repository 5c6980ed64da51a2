use fedgeo_core::{distance, BucketId, Circle, QueryShape, Rectangle};
use fedgeo_dp::{bounded_radius, BoundedRadius, BoundedSearch, DpError, NoiseSampler};
use fedgeo_grid::GridGeometry;
use serde::{Deserialize, Serialize};

/// Relative widening applied to perturbed extents so rounding in the
/// distance computation can never shrink the range below the true one.
const COVERAGE_SLACK: f64 = 1e-9;

/// Mechanism used to move a query center before it is sent to any silo.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SpatialMechanism {
    #[default]
    Planar,
    Bounded {
        delta: f64,
        #[serde(default)]
        search: BoundedSearch,
    },
    TwiceLaplace {
        #[serde(rename = "sensitivity-x")]
        sensitivity_x: f64,
        #[serde(rename = "sensitivity-y")]
        sensitivity_y: f64,
    },
}

impl SpatialMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpatialMechanism::Planar => "planar",
            SpatialMechanism::Bounded { .. } => "bounded",
            SpatialMechanism::TwiceLaplace { .. } => "twice-laplace",
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Prepared {
    Planar,
    Bounded(BoundedRadius),
    TwiceLaplace { sx: f64, sy: f64 },
}

/// A mechanism with its parameters checked and, for the bounded variant,
/// the truncation radius already solved.
#[derive(Clone, Copy, Debug)]
pub struct QueryPerturber {
    epsilon: f64,
    mechanism: Prepared,
}

impl QueryPerturber {
    pub fn new(epsilon: f64, mechanism: &SpatialMechanism) -> Result<Self, DpError> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(DpError::InvalidEpsilon(epsilon));
        }
        let mechanism = match *mechanism {
            SpatialMechanism::Planar => Prepared::Planar,
            SpatialMechanism::Bounded { delta, search } => {
                Prepared::Bounded(bounded_radius(epsilon, delta, search)?)
            }
            SpatialMechanism::TwiceLaplace {
                sensitivity_x,
                sensitivity_y,
            } => {
                for sensitivity in [sensitivity_x, sensitivity_y] {
                    if !(sensitivity.is_finite() && sensitivity > 0.0) {
                        return Err(DpError::InvalidSensitivity(sensitivity));
                    }
                }
                Prepared::TwiceLaplace {
                    sx: sensitivity_x,
                    sy: sensitivity_y,
                }
            }
        };
        Ok(Self { epsilon, mechanism })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Truncation radius of the bounded mechanism, if configured.
    pub fn bound(&self) -> Option<f64> {
        match self.mechanism {
            Prepared::Bounded(bound) => Some(bound.radius),
            _ => None,
        }
    }

    /// Moves the center of `shape` and grows it so the result contains the
    /// original: a circle's radius grows by the displacement, a rectangle's
    /// half extents by the per-axis displacement.
    pub fn perturb(
        &self,
        shape: &QueryShape,
        sampler: &mut NoiseSampler,
    ) -> Result<QueryShape, DpError> {
        let center = shape.center();
        let moved = match self.mechanism {
            Prepared::Planar => sampler.planar_laplace(center, self.epsilon)?,
            Prepared::Bounded(bound) => {
                sampler.bounded_planar_laplace(center, self.epsilon, &bound)?
            }
            Prepared::TwiceLaplace { sx, sy } => {
                sampler.twice_laplace(center, sx, sy, self.epsilon)?
            }
        };
        let widen = |extent: f64| extent * (1.0 + COVERAGE_SLACK) + f64::EPSILON;
        Ok(match shape {
            QueryShape::Circle(circle) => QueryShape::Circle(Circle::new(
                moved.x,
                moved.y,
                widen(circle.radius + distance(center, moved)),
            )),
            QueryShape::Rectangle(rect) => QueryShape::Rectangle(Rectangle::new(
                moved.x,
                moved.y,
                widen(rect.half_width + (moved.x - center.x).abs()),
                widen(rect.half_height + (moved.y - center.y).abs()),
            )),
        })
    }
}

/// Buckets of `geometry` whose cell overlaps `range` and whose published
/// count is nonzero, in ascending id order.
pub fn candidate_buckets(
    geometry: &GridGeometry,
    noisy_counts: &[i64],
    range: &QueryShape,
) -> Vec<BucketId> {
    let bbox = match range {
        QueryShape::Circle(circle) => circle.bounding_box(),
        QueryShape::Rectangle(rect) => *rect,
    };
    let mut candidates = Vec::new();
    for interval in geometry.bucket_intervals(&bbox) {
        for id in interval {
            if noisy_counts.get(id as usize).copied().unwrap_or(0) <= 0 {
                continue;
            }
            let Some(cell) = geometry.bucket_rect(id) else {
                continue;
            };
            let overlaps = match range {
                QueryShape::Circle(circle) => circle.intersects_rectangle(&cell),
                QueryShape::Rectangle(rect) => rect.intersects(&cell),
            };
            if overlaps {
                candidates.push(id);
            }
        }
    }
    candidates
}
