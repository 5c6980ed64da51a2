//! Lower branch of the Lambert W function.

use std::f64::consts::E;

const MAX_HALLEY_STEPS: usize = 64;
const TOLERANCE: f64 = 1e-14;

/// `W₋₁(x)`: the solution `w ≤ -1` of `w·eʷ = x`, defined for
/// `-1/e ≤ x < 0`. Returns `None` outside that domain.
pub fn lambert_w_minus1(x: f64) -> Option<f64> {
    let branch_point = -1.0 / E;
    if !x.is_finite() || x < branch_point || x >= 0.0 {
        return None;
    }
    if x == branch_point {
        return Some(-1.0);
    }

    let mut w = initial_guess(x);
    for _ in 0..MAX_HALLEY_STEPS {
        let ew = w.exp();
        let f = w * ew - x;
        let wp1 = w + 1.0;
        if wp1.abs() < f64::EPSILON {
            break;
        }
        let denom = ew * wp1 - (w + 2.0) * f / (2.0 * wp1);
        let next = w - f / denom;
        if !next.is_finite() {
            break;
        }
        let done = (next - w).abs() <= TOLERANCE * next.abs().max(1.0);
        w = next.min(-1.0);
        if done {
            break;
        }
    }
    Some(w)
}

fn initial_guess(x: f64) -> f64 {
    if x < -0.25 {
        // series around the branch point
        let p = -(2.0 * (1.0 + E * x)).max(0.0).sqrt();
        -1.0 + p - p * p / 3.0 + 11.0 / 72.0 * p * p * p
    } else {
        let l1 = (-x).ln();
        let l2 = (-l1).ln();
        l1 - l2 + l2 / l1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfies_defining_equation() {
        for x in [-0.367, -0.3, -0.2, -0.1, -1e-3, -1e-8, -1e-30] {
            let w = lambert_w_minus1(x).unwrap();
            assert!(w <= -1.0, "w={w} for x={x}");
            let residual = (w * w.exp() - x).abs();
            assert!(residual <= 1e-12 * x.abs().max(1e-300) + 1e-300, "x={x} w={w}");
        }
    }

    #[test]
    fn known_values() {
        assert!((lambert_w_minus1(-0.1).unwrap() - (-3.577152063957297)).abs() < 1e-10);
        assert_eq!(lambert_w_minus1(-1.0 / E), Some(-1.0));
    }

    #[test]
    fn rejects_out_of_domain() {
        assert_eq!(lambert_w_minus1(0.0), None);
        assert_eq!(lambert_w_minus1(0.5), None);
        assert_eq!(lambert_w_minus1(-0.5), None);
        assert_eq!(lambert_w_minus1(f64::NAN), None);
    }
}
