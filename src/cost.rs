//! # Cost Assembler
//!
//! Turns one agent's planning problem into a [`QuadraticProblem`] over the
//! curve control points `x`, one slack variable per colliding neighbour and a
//! last slack shared by the position bounds.
//!
//! ```text
//! J = ½ xᵀ H_energy x                       control effort
//!   + Σ_k w_k ‖p_k(x) − r_k‖²               goal tracking
//!   + collision terms                        from the avoider
//!   + Σ lin·ε + quad·ε²                      slack penalties
//! ```
//!
//! with predicted positions `p(x) = Φ_pos x + A0_pos x0`. Everything that does
//! not depend on the current state is built once in [`CostAssembler::new`];
//! a cycle only fills in right-hand sides and the collision rows.
//!
//! Position bounds start at the second horizon step. The first one is fixed
//! by the state and the pinned `u(0)`, so no control can correct it. The
//! remaining rows are soft: an agent already drifting out of the box gets
//! the least violating plan instead of an infeasible problem.

use crate::avoidance::{AvoidanceTerms, Regime};
use crate::bezier::BezierCurve;
use crate::model::StatePropagator;
use crate::solver::QuadraticProblem;
use crate::structs::{MpcParams, TuningParams};
use nalgebra::{DMatrix, DVector, Vector3};

#[derive(Debug, Clone)]
pub struct CostAssembler {
    num_vars: usize,
    steps: usize,
    /// Energy plus free-flight tracking.
    h_free: DMatrix<f64>,
    /// Energy plus obstacle-regime tracking.
    h_obs: DMatrix<f64>,
    /// `2 Φ_posᵀ W`, mapping the tracking error at `x = 0` to the linear term.
    fpf_free: DMatrix<f64>,
    fpf_obs: DMatrix<f64>,
    phi_pos: DMatrix<f64>,
    a0_pos: DMatrix<f64>,
    /// Position bounds from step 1 (upper, then lower) followed by
    /// acceleration bounds.
    a_in: DMatrix<f64>,
    bounded_rows: usize,
    b_accel: DVector<f64>,
    pmin: DVector<f64>,
    pmax: DVector<f64>,
    /// Continuity rows followed by the three `u(0)` rows.
    a_eq: DMatrix<f64>,
    lin_coll: f64,
    quad_coll: f64,
}

fn dvec3(v: &Vector3<f64>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

fn tracking_terms(
    phi_pos: &DMatrix<f64>,
    base: f64,
    spd: u32,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let weights = DVector::from_fn(phi_pos.nrows(), |r, _| {
        TuningParams::step_weight(base, spd, r / 3 + 1)
    });
    let fpf = phi_pos.transpose() * DMatrix::from_diagonal(&weights) * 2.0;
    let hessian = &fpf * phi_pos;
    (hessian, fpf)
}

impl CostAssembler {
    pub fn new(curve: &BezierCurve, prediction: &StatePropagator, mpc: &MpcParams) -> Self {
        let tuning = &mpc.tuning;
        let limits = &mpc.limits;
        let steps = prediction.steps();
        let n = curve.num_vars();
        let phi_pos = prediction.phi_pos().clone();

        let energy = curve.energy_hessian(&tuning.energy_weights);
        let (track_free, fpf_free) = tracking_terms(&phi_pos, tuning.s_free, tuning.spd_f);
        let (track_obs, fpf_obs) = tracking_terms(&phi_pos, tuning.s_obs, tuning.spd_o);

        let (a_accel, b_accel) = curve.control_point_bounds(&limits.amin, &limits.amax);
        let bounded = 3 * steps.saturating_sub(1);
        let reachable = phi_pos.rows(3 * steps - bounded, bounded).into_owned();
        let mut a_in = DMatrix::zeros(2 * bounded + a_accel.nrows(), n);
        a_in.rows_mut(0, bounded).copy_from(&reachable);
        a_in.rows_mut(bounded, bounded).copy_from(&(-&reachable));
        a_in.rows_mut(2 * bounded, a_accel.nrows())
            .copy_from(&a_accel);

        let continuity = curve.continuity_constraints();
        let initial = curve.initial_value_rows();
        let mut a_eq = DMatrix::zeros(continuity.nrows() + initial.nrows(), n);
        a_eq.rows_mut(0, continuity.nrows()).copy_from(&continuity);
        a_eq.rows_mut(continuity.nrows(), initial.nrows())
            .copy_from(&initial);

        let stacked = |v: &Vector3<f64>| DVector::from_fn(bounded, |r, _| v[r % 3]);

        CostAssembler {
            num_vars: n,
            steps,
            h_free: &energy + track_free,
            h_obs: &energy + track_obs,
            fpf_free,
            fpf_obs,
            a0_pos: prediction.a0_pos().clone(),
            phi_pos,
            a_in,
            bounded_rows: bounded,
            b_accel,
            pmin: stacked(&limits.pmin),
            pmax: stacked(&limits.pmax),
            a_eq,
            lin_coll: tuning.lin_coll,
            quad_coll: tuning.quad_coll,
        }
    }

    /// Number of control-point variables (slack variables come after).
    /// The position-bound slack is always the last variable.
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// QP for one agent.
    ///
    /// `x0` is `[p; v]`, `reference` is `3 x steps` (one waypoint per column),
    /// `a0` pins the curve's initial acceleration.
    pub fn build_qp(
        &self,
        x0: &DVector<f64>,
        reference: &DMatrix<f64>,
        a0: &Vector3<f64>,
        terms: &AvoidanceTerms,
    ) -> QuadraticProblem {
        let n = self.num_vars;
        let m = terms.num_slack;
        let bound_slack = n + m;
        let nz = bound_slack + 1;
        let bounded = self.bounded_rows;
        let first_bounded = 3 * self.steps - bounded;

        let (h_track, fpf) = match terms.regime {
            Regime::Free => (&self.h_free, &self.fpf_free),
            Regime::Obstacle => (&self.h_obs, &self.fpf_obs),
        };

        let free_pos = &self.a0_pos * x0;
        let reference = DVector::from_column_slice(reference.as_slice());

        let mut h_ctrl = h_track.clone();
        let mut f_ctrl = fpf * (&free_pos - &reference);

        for rep in &terms.repulsion {
            let phi_k = self.phi_pos.rows(3 * rep.step, 3);
            f_ctrl += phi_k.transpose() * dvec3(&rep.gradient);
        }

        for pen in &terms.penalties {
            let phi_k = self.phi_pos.rows(3 * pen.step, 3).into_owned();
            let error = free_pos.rows(3 * pen.step, 3).into_owned() - dvec3(&pen.target);
            h_ctrl += phi_k.transpose() * &phi_k * (2.0 * pen.weight);
            f_ctrl += phi_k.transpose() * error * (2.0 * pen.weight);
        }

        let mut h = DMatrix::zeros(nz, nz);
        h.view_mut((0, 0), (n, n)).copy_from(&h_ctrl);
        let mut f = DVector::zeros(nz);
        f.rows_mut(0, n).copy_from(&f_ctrl);
        for s in n..nz {
            h[(s, s)] = 2.0 * self.quad_coll;
            f[s] = self.lin_coll;
        }

        // Inequalities: static template, then separation rows, then ε ≥ 0.
        let base_rows = self.a_in.nrows();
        let num_rows = base_rows + terms.separation.len() + m + 1;
        let mut a = DMatrix::zeros(num_rows, nz);
        let mut b = DVector::zeros(num_rows);
        a.view_mut((0, 0), (base_rows, n)).copy_from(&self.a_in);
        for r in 0..2 * bounded {
            a[(r, bound_slack)] = -1.0;
        }
        let free_bounded = free_pos.rows(first_bounded, bounded).into_owned();
        b.rows_mut(0, bounded)
            .copy_from(&(&self.pmax - &free_bounded));
        b.rows_mut(bounded, bounded)
            .copy_from(&(&free_bounded - &self.pmin));
        b.rows_mut(2 * bounded, self.b_accel.len())
            .copy_from(&self.b_accel);

        let mut row = base_rows;
        for sep in &terms.separation {
            let normal = dvec3(&sep.normal);
            let coeffs = self.phi_pos.rows(3 * sep.step, 3).transpose() * &normal;
            for c in 0..n {
                a[(row, c)] = -coeffs[c];
            }
            a[(row, n + sep.slack)] = -1.0;
            b[row] = normal.dot(&free_pos.rows(3 * sep.step, 3)) - sep.bound;
            row += 1;
        }
        for s in n..nz {
            a[(row, s)] = -1.0;
            row += 1;
        }

        let eq_rows = self.a_eq.nrows();
        let mut a_eq = DMatrix::zeros(eq_rows, nz);
        a_eq.view_mut((0, 0), (eq_rows, n)).copy_from(&self.a_eq);
        let mut b_eq = DVector::zeros(eq_rows);
        b_eq.rows_mut(eq_rows - 3, 3).copy_from(&dvec3(a0));

        QuadraticProblem {
            h,
            f,
            a,
            b,
            a_eq,
            b_eq,
        }
    }
}
