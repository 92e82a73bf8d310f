// THEORY:
// The `geometry` module is the numeric toolbox of the expanded search. It is a
// stateless utility: every function takes plain slices or points and returns plain
// values, with no knowledge of sequences or frames.
//
// Key architectural principles:
// 1.  **Short-Horizon Regression**: Marker trajectories are modelled per axis as a
//     low-order polynomial of time. The fit is a classic least-squares problem on a
//     Vandermonde design matrix, solved through an SVD so that nearly singular
//     systems degrade gracefully instead of blowing up.
// 2.  **Degenerate Input Is Not an Error**: Too few samples, repeated timestamps or
//     a failed decomposition all yield an all-zero coefficient vector. Callers treat
//     an all-zero fit as "no usable prediction"; nothing in here panics.
// 3.  **Containment Tests**: The search regions used to accept a candidate point
//     (axis-aligned ellipse, triangle) are simple closed-form predicates, boundary
//     inclusive.

use crate::core_modules::point_state::Point2;
use nalgebra::{DMatrix, DVector};

/// Singular values below this are treated as zero when solving the regression.
const SVD_EPS: f64 = 1e-12;
/// Twice the signed area below which a triangle is considered degenerate.
const MIN_TRIANGLE_AREA: f64 = 1e-9;

/// Result of a per-axis polynomial regression.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyFit {
    /// Coefficients of `value(t - time_origin)`, lowest order first.
    pub coeffs: Vec<f64>,
    /// Time shift applied to the samples before fitting.
    pub time_origin: f64,
    /// Root-mean-square residual of the fit over the input samples.
    pub rms_residual: f64,
}

impl PolyFit {
    fn zero(order: usize, time_origin: f64) -> Self {
        Self {
            coeffs: vec![0.0; order + 1],
            time_origin,
            rms_residual: 0.0,
        }
    }

    /// A fit whose coefficients are all exactly zero carries no prediction.
    pub fn is_valid(&self) -> bool {
        self.coeffs.iter().any(|c| *c != 0.0)
    }

    /// Evaluates the fitted polynomial at absolute time `t`.
    pub fn evaluate(&self, t: f64) -> f64 {
        let dt = t - self.time_origin;
        // Horner
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * dt + c)
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator). Zero for fewer than two values.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Least-squares polynomial fit of `values` against `times`.
///
/// The requested order is clamped to `samples - 1`. Timestamps must strictly
/// increase; anything else returns an all-zero fit.
pub fn polyfit(times: &[f64], values: &[f64], order: usize) -> PolyFit {
    let time_origin = times.first().copied().unwrap_or(0.0);
    let n = times.len();
    if n != values.len() || n < 2 {
        return PolyFit::zero(order, time_origin);
    }
    if !times.windows(2).all(|w| w[1] > w[0]) {
        return PolyFit::zero(order, time_origin);
    }

    let order = order.min(n - 1);
    let cols = order + 1;

    // Vandermonde design matrix on shifted time.
    let mut a = DMatrix::<f64>::zeros(n, cols);
    for (row, t) in times.iter().enumerate() {
        let dt = t - time_origin;
        let mut power = 1.0;
        for col in 0..cols {
            a[(row, col)] = power;
            power *= dt;
        }
    }
    let b = DVector::from_column_slice(values);

    let svd = a.clone().svd(true, true);
    let solution = match svd.solve(&b, SVD_EPS) {
        Ok(x) => x,
        Err(_) => return PolyFit::zero(order, time_origin),
    };
    if solution.iter().any(|c| !c.is_finite()) {
        return PolyFit::zero(order, time_origin);
    }

    let residuals = &a * &solution - &b;
    let rms_residual = (residuals.norm_squared() / n as f64).sqrt();

    PolyFit {
        coeffs: solution.iter().copied().collect(),
        time_origin,
        rms_residual,
    }
}

/// Axis-aligned ellipse containment, boundary inclusive.
pub fn inside_ellipse(center: &Point2, radii: &Point2, p: &Point2) -> bool {
    if radii.x <= 0.0 || radii.y <= 0.0 {
        return false;
    }
    let dx = (p.x - center.x) / radii.x;
    let dy = (p.y - center.y) / radii.y;
    dx * dx + dy * dy <= 1.0
}

fn edge_sign(p1: &Point2, p2: &Point2, p3: &Point2) -> f64 {
    (p1.x - p3.x) * (p2.y - p3.y) - (p2.x - p3.x) * (p1.y - p3.y)
}

/// Triangle containment, boundary inclusive. Degenerate triangles contain nothing.
pub fn inside_triangle(a: &Point2, b: &Point2, c: &Point2, p: &Point2) -> bool {
    if edge_sign(a, b, c).abs() < MIN_TRIANGLE_AREA {
        return false;
    }
    let d1 = edge_sign(p, a, b);
    let d2 = edge_sign(p, b, c);
    let d3 = edge_sign(p, c, a);
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

/// The two vectors perpendicular to `v` with the given length, counter-clockwise
/// one first. A zero `v` yields two zero vectors.
pub fn orthogonal_vectors(v: &Point2, length: f64) -> [Point2; 2] {
    let n = v.norm();
    if n == 0.0 {
        return [Point2::ZERO, Point2::ZERO];
    }
    let ortho = Point2::new(-v.y / n * length, v.x / n * length);
    [ortho, ortho.scale(-1.0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn std_dev_uses_sample_denominator() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(mean(&v), 5.0);
        assert_relative_eq!(sample_std_dev(&v), (32.0f64 / 7.0).sqrt(), epsilon = 1e-12);
        assert_eq!(sample_std_dev(&[3.0]), 0.0);
    }

    #[test]
    fn polyfit_recovers_a_line() {
        let times = [10.0, 11.0, 12.0, 13.0, 14.0];
        let values: Vec<f64> = times.iter().map(|t| 3.0 + 2.0 * (t - 10.0)).collect();
        let fit = polyfit(&times, &values, 2);
        assert!(fit.is_valid());
        assert_eq!(fit.coeffs.len(), 3);
        assert_relative_eq!(fit.evaluate(16.0), 15.0, epsilon = 1e-8);
        assert!(fit.rms_residual < 1e-9);
    }

    #[test]
    fn polyfit_recovers_a_parabola() {
        let times = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5];
        let values: Vec<f64> = times.iter().map(|t| 1.0 - t + 4.0 * t * t).collect();
        let fit = polyfit(&times, &values, 2);
        assert_relative_eq!(fit.coeffs[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(fit.coeffs[1], -1.0, epsilon = 1e-9);
        assert_relative_eq!(fit.coeffs[2], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn polyfit_clamps_order_to_sample_count() {
        let fit = polyfit(&[0.0, 1.0], &[5.0, 7.0], 3);
        assert_eq!(fit.coeffs.len(), 2);
        assert_relative_eq!(fit.evaluate(2.0), 9.0, epsilon = 1e-9);
    }

    #[test]
    fn degenerate_timestamps_give_an_invalid_fit() {
        assert!(!polyfit(&[1.0, 1.0, 1.0], &[4.0, 5.0, 6.0], 2).is_valid());
        assert!(!polyfit(&[2.0, 1.0, 3.0], &[4.0, 5.0, 6.0], 2).is_valid());
        assert!(!polyfit(&[1.0], &[4.0], 2).is_valid());
        assert!(!polyfit(&[1.0, 2.0], &[4.0], 1).is_valid());
    }

    #[test]
    fn a_fit_of_zeros_is_invalid() {
        let fit = polyfit(&[0.0, 1.0, 2.0], &[0.0, 0.0, 0.0], 1);
        assert!(!fit.is_valid());
    }

    #[test]
    fn ellipse_containment() {
        let c = Point2::new(102.0, 98.0);
        let r = Point2::new(2.0, 3.0);
        assert!(inside_ellipse(&c, &r, &Point2::new(102.0, 97.0)));
        assert!(inside_ellipse(&c, &r, &Point2::new(104.0, 98.0)));
        assert!(!inside_ellipse(&c, &r, &Point2::new(104.0, 99.0)));
        assert!(!inside_ellipse(&c, &Point2::new(0.0, 3.0), &c));
    }

    #[test]
    fn triangle_containment() {
        let a = Point2::new(0.0, 0.0);
        let b = Point2::new(10.0, 0.0);
        let c = Point2::new(0.0, 10.0);
        assert!(inside_triangle(&a, &b, &c, &Point2::new(2.0, 2.0)));
        assert!(inside_triangle(&a, &b, &c, &Point2::new(5.0, 0.0)));
        assert!(!inside_triangle(&a, &b, &c, &Point2::new(6.0, 6.0)));
        assert!(!inside_triangle(&a, &a, &c, &Point2::new(0.0, 1.0)));
    }

    #[test]
    fn orthogonal_vectors_are_perpendicular_and_scaled() {
        let v = Point2::new(3.0, 4.0);
        let [u, w] = orthogonal_vectors(&v, 10.0);
        assert_relative_eq!(u.x * v.x + u.y * v.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(u.norm(), 10.0, epsilon = 1e-12);
        assert_eq!(w, u.scale(-1.0));
        assert_eq!(orthogonal_vectors(&Point2::ZERO, 3.0), [Point2::ZERO, Point2::ZERO]);
    }
}
