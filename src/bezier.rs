//! # Bezier Curve Basis
//!
//! Piecewise Bezier parameterization of an agent's commanded acceleration.
//! A curve is `num_segments` segments of degree `deg`, each lasting
//! `t_segment` seconds, in three axes. The decision vector stacks the control
//! points segment by segment, point by point, axis by axis:
//!
//! ```text
//! x[(s * (deg + 1) + i) * 3 + axis] = control point i of segment s
//! ```
//!
//! Every matrix produced here depends only on the curve parameters, so they
//! are built once per generator.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

pub const DIM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BezierParams {
    pub deg: usize,
    pub num_segments: usize,
    pub t_segment: f64,
    /// Highest derivative kept continuous across segment junctions.
    pub deg_poly: usize,
}

impl Default for BezierParams {
    fn default() -> Self {
        BezierParams {
            deg: 5,
            num_segments: 3,
            t_segment: 1.0,
            deg_poly: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BezierCurve {
    params: BezierParams,
}

pub fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

fn bernstein(deg: usize, i: usize, tau: f64) -> f64 {
    binomial(deg, i) * tau.powi(i as i32) * (1.0 - tau).powi((deg - i) as i32)
}

/// `G[i][j] = ∫_0^1 B_i B_j dτ` for the degree-`n` Bernstein basis.
fn bernstein_gram(n: usize) -> DMatrix<f64> {
    DMatrix::from_fn(n + 1, n + 1, |i, j| {
        binomial(n, i) * binomial(n, j) / ((2 * n + 1) as f64 * binomial(2 * n, i + j))
    })
}

impl BezierCurve {
    pub fn new(params: BezierParams) -> Self {
        BezierCurve { params }
    }

    pub fn params(&self) -> &BezierParams {
        &self.params
    }

    pub fn num_ctrl_pts(&self) -> usize {
        self.params.num_segments * (self.params.deg + 1)
    }

    /// Length of the decision vector.
    pub fn num_vars(&self) -> usize {
        self.num_ctrl_pts() * DIM
    }

    pub fn duration(&self) -> f64 {
        self.params.num_segments as f64 * self.params.t_segment
    }

    fn index(&self, segment: usize, point: usize, axis: usize) -> usize {
        (segment * (self.params.deg + 1) + point) * DIM + axis
    }

    fn locate(&self, t: f64) -> (usize, f64) {
        let t = t.clamp(0.0, self.duration());
        let last = self.params.num_segments - 1;
        let segment = ((t / self.params.t_segment).floor() as usize).min(last);
        let tau = (t - segment as f64 * self.params.t_segment) / self.params.t_segment;
        (segment, tau.clamp(0.0, 1.0))
    }

    /// Maps the decision vector to the curve value at each of `times`,
    /// stacked as `3 * times.len()` rows.
    pub fn sampling_matrix(&self, times: &[f64]) -> DMatrix<f64> {
        let deg = self.params.deg;
        let mut rho = DMatrix::zeros(DIM * times.len(), self.num_vars());
        for (row, &t) in times.iter().enumerate() {
            let (segment, tau) = self.locate(t);
            for i in 0..=deg {
                let b = bernstein(deg, i, tau);
                for axis in 0..DIM {
                    rho[(DIM * row + axis, self.index(segment, i, axis))] = b;
                }
            }
        }
        rho
    }

    /// Evaluates the curve defined by `ctrl` at time `t`.
    pub fn evaluate(&self, ctrl: &[f64], t: f64) -> Vector3<f64> {
        let deg = self.params.deg;
        let (segment, tau) = self.locate(t);
        let mut value = Vector3::zeros();
        for i in 0..=deg {
            let b = bernstein(deg, i, tau);
            for axis in 0..DIM {
                value[axis] += b * ctrl[self.index(segment, i, axis)];
            }
        }
        value
    }

    /// Hessian of `Σ_axis w_axis ∫ (u_axis² + u_axis'²) dt` over the whole curve.
    pub fn energy_hessian(&self, weights: &Vector3<f64>) -> DMatrix<f64> {
        let deg = self.params.deg;
        let t_seg = self.params.t_segment;

        let gram = bernstein_gram(deg);
        let mut diff = DMatrix::zeros(deg, deg + 1);
        for i in 0..deg {
            diff[(i, i)] = -1.0;
            diff[(i, i + 1)] = 1.0;
        }
        let gram_deriv = diff.transpose() * bernstein_gram(deg - 1) * &diff;
        let scale_deriv = (deg as f64 / t_seg).powi(2) * t_seg;
        let per_segment = gram * t_seg + gram_deriv * scale_deriv;

        let mut hessian = DMatrix::zeros(self.num_vars(), self.num_vars());
        for s in 0..self.params.num_segments {
            for i in 0..=deg {
                for j in 0..=deg {
                    for axis in 0..DIM {
                        hessian[(self.index(s, i, axis), self.index(s, j, axis))] +=
                            2.0 * weights[axis] * per_segment[(i, j)];
                    }
                }
            }
        }
        hessian
    }

    /// Equality rows (zero right-hand side) keeping derivatives `0..=deg_poly`
    /// continuous between consecutive segments.
    pub fn continuity_constraints(&self) -> DMatrix<f64> {
        let deg = self.params.deg;
        let orders = self.params.deg_poly + 1;
        let junctions = self.params.num_segments - 1;
        let mut aeq = DMatrix::zeros(junctions * orders * DIM, self.num_vars());

        let mut row = 0;
        for s in 0..junctions {
            for r in 0..orders {
                for axis in 0..DIM {
                    for j in 0..=r {
                        let coeff = binomial(r, j) * if (r - j) % 2 == 0 { 1.0 } else { -1.0 };
                        // End of segment s minus start of segment s + 1.
                        aeq[(row, self.index(s, deg - r + j, axis))] += coeff;
                        aeq[(row, self.index(s + 1, j, axis))] -= coeff;
                    }
                    row += 1;
                }
            }
        }
        aeq
    }

    /// Rows selecting `u(0)`.
    pub fn initial_value_rows(&self) -> DMatrix<f64> {
        let mut rows = DMatrix::zeros(DIM, self.num_vars());
        for axis in 0..DIM {
            rows[(axis, self.index(0, 0, axis))] = 1.0;
        }
        rows
    }

    /// Box on every control point, `A x ≤ b` with `2 n` rows (upper bounds
    /// first). A Bezier segment stays inside the hull of its control points,
    /// so the whole curve respects the box.
    pub fn control_point_bounds(
        &self,
        min: &Vector3<f64>,
        max: &Vector3<f64>,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.num_vars();
        let mut a = DMatrix::zeros(2 * n, n);
        let mut b = DVector::zeros(2 * n);
        for var in 0..n {
            let axis = var % DIM;
            a[(var, var)] = 1.0;
            b[var] = max[axis];
            a[(n + var, var)] = -1.0;
            b[n + var] = -min[axis];
        }
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn curve(deg: usize, num_segments: usize, deg_poly: usize) -> BezierCurve {
        BezierCurve::new(BezierParams {
            deg,
            num_segments,
            t_segment: 0.5,
            deg_poly,
        })
    }

    /// Control points of `u(t) = a + b t` (same on every axis).
    fn linear_ctrl(c: &BezierCurve, a: f64, b: f64) -> DVector<f64> {
        let p = *c.params();
        let mut x = DVector::zeros(c.num_vars());
        for s in 0..p.num_segments {
            let t0 = s as f64 * p.t_segment;
            let t1 = t0 + p.t_segment;
            for i in 0..=p.deg {
                let frac = i as f64 / p.deg as f64;
                let value = a + b * (t0 + frac * (t1 - t0));
                for axis in 0..DIM {
                    x[c.index(s, i, axis)] = value;
                }
            }
        }
        x
    }

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(5, 0), 1.0);
        assert_eq!(binomial(5, 2), 10.0);
        assert_eq!(binomial(6, 3), 20.0);
        assert_eq!(binomial(3, 4), 0.0);
    }

    #[test]
    fn test_dimensions() {
        let c = curve(4, 3, 2);
        assert_eq!(c.num_ctrl_pts(), 15);
        assert_eq!(c.num_vars(), 45);
        assert_relative_eq!(c.duration(), 1.5);
    }

    #[test]
    fn test_sampling_rows_are_partition_of_unity() {
        let c = curve(4, 3, 2);
        let times: Vec<f64> = (0..=15).map(|k| k as f64 * 0.1).collect();
        let rho = c.sampling_matrix(&times);
        assert_eq!(rho.nrows(), 3 * times.len());
        for r in 0..rho.nrows() {
            assert_relative_eq!(rho.row(r).sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sampling_reproduces_linear_function() {
        let c = curve(3, 2, 1);
        let x = linear_ctrl(&c, 0.5, 2.0);
        let times = [0.0, 0.2, 0.5, 0.77, 1.0];
        let samples = c.sampling_matrix(&times) * &x;
        for (k, &t) in times.iter().enumerate() {
            for axis in 0..DIM {
                assert_relative_eq!(samples[3 * k + axis], 0.5 + 2.0 * t, epsilon = 1e-12);
            }
            assert_relative_eq!(c.evaluate(x.as_slice(), t)[0], 0.5 + 2.0 * t, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sampling_clamps_past_end() {
        let c = curve(3, 2, 1);
        let x = linear_ctrl(&c, 0.0, 1.0);
        let v = c.evaluate(x.as_slice(), 10.0);
        assert_relative_eq!(v[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_energy_of_constant_curve() {
        let c = curve(4, 2, 1);
        let weights = Vector3::new(1.0, 2.0, 0.0);
        let hessian = c.energy_hessian(&weights);
        let x = linear_ctrl(&c, 1.5, 0.0);
        // 0.5 x'Hx = Σ w ∫ u² = (1 + 2) * 1.5² * 1.0
        let energy = 0.5 * (x.transpose() * &hessian * &x)[0];
        assert_relative_eq!(energy, 3.0 * 2.25, epsilon = 1e-9);
    }

    #[test]
    fn test_energy_of_linear_curve() {
        let c = curve(3, 2, 1);
        let weights = Vector3::new(1.0, 0.0, 0.0);
        let hessian = c.energy_hessian(&weights);
        let x = linear_ctrl(&c, 0.0, 2.0);
        // ∫_0^1 (2t)² + 2² dt = 4/3 + 4
        let energy = 0.5 * (x.transpose() * &hessian * &x)[0];
        assert_relative_eq!(energy, 4.0 / 3.0 + 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_energy_hessian_is_symmetric() {
        let c = curve(5, 3, 2);
        let hessian = c.energy_hessian(&Vector3::new(1.0, 1.0, 3.0));
        assert_relative_eq!(hessian.clone(), hessian.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_continuity_holds_for_smooth_curve() {
        let c = curve(4, 3, 1);
        let aeq = c.continuity_constraints();
        assert_eq!(aeq.nrows(), 2 * 2 * 3);
        let x = linear_ctrl(&c, -1.0, 0.7);
        assert!((aeq * x).amax() < 1e-12);
    }

    #[test]
    fn test_continuity_detects_jump() {
        let c = curve(3, 2, 0);
        let mut x = linear_ctrl(&c, 0.0, 1.0);
        x[c.index(1, 0, 2)] += 0.3;
        let residual = c.continuity_constraints() * x;
        assert_relative_eq!(residual.amax(), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_initial_value_rows() {
        let c = curve(3, 2, 1);
        let x = linear_ctrl(&c, 0.25, 1.0);
        let u0 = c.initial_value_rows() * x;
        assert_eq!(u0.len(), 3);
        for axis in 0..DIM {
            assert_relative_eq!(u0[axis], 0.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_control_point_bounds() {
        let c = curve(2, 1, 0);
        let (a, b) =
            c.control_point_bounds(&Vector3::new(-1.0, -2.0, -3.0), &Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(a.nrows(), 2 * c.num_vars());
        let inside = linear_ctrl(&c, 0.5, 0.0);
        assert!((&a * &inside - &b).max() <= 0.0);

        let mut outside = inside.clone();
        outside[c.index(0, 1, 2)] = -3.5;
        assert_relative_eq!((&a * &outside - &b).max(), 0.5, epsilon = 1e-12);
    }
}
