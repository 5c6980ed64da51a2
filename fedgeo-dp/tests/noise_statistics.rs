use fedgeo_core::{distance, Point};
use fedgeo_dp::NoiseSampler;

fn mean_and_variance(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

#[test]
fn laplace_moments_match_scale() {
    let mut sampler = NoiseSampler::from_seed([42u8; 32]);
    let (sensitivity, epsilon) = (1.0, 0.5);
    let samples: Vec<f64> = (0..100_000)
        .map(|_| sampler.laplace(sensitivity, epsilon).expect("laplace draw"))
        .collect();
    let (mean, variance) = mean_and_variance(&samples);
    let expected = 2.0 * (sensitivity / epsilon).powi(2);
    assert!(mean.abs() < 0.05, "mean drifted: {mean}");
    assert!(
        (variance - expected).abs() / expected < 0.05,
        "variance {variance} vs {expected}"
    );
}

#[test]
fn planar_radius_has_gamma_mean() {
    let mut sampler = NoiseSampler::from_seed([9u8; 32]);
    let epsilon = 0.25;
    let origin = Point::new(10.0, 20.0);
    let n = 50_000;
    let total: f64 = (0..n)
        .map(|_| distance(origin, sampler.planar_laplace(origin, epsilon).expect("planar draw")))
        .sum();
    let mean = total / n as f64;
    let expected = 2.0 / epsilon;
    assert!((mean - expected).abs() / expected < 0.03, "mean radius {mean}");
}

#[test]
fn twice_laplace_splits_budget_per_axis() {
    let mut sampler = NoiseSampler::from_seed([3u8; 32]);
    let origin = Point::new(0.0, 0.0);
    let (sx, sy, epsilon) = (1.0, 2.0, 1.0);
    let draws: Vec<Point> = (0..100_000)
        .map(|_| sampler.twice_laplace(origin, sx, sy, epsilon).expect("twice laplace"))
        .collect();
    let xs: Vec<f64> = draws.iter().map(|p| p.x).collect();
    let ys: Vec<f64> = draws.iter().map(|p| p.y).collect();
    let (_, var_x) = mean_and_variance(&xs);
    let (_, var_y) = mean_and_variance(&ys);
    let expected_x = 2.0 * (sx / (epsilon / 2.0)).powi(2);
    let expected_y = 2.0 * (sy / (epsilon / 2.0)).powi(2);
    assert!((var_x - expected_x).abs() / expected_x < 0.05, "var_x {var_x}");
    assert!((var_y - expected_y).abs() / expected_y < 0.05, "var_y {var_y}");
}
