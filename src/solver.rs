//! # QP Solver Adapter
//!
//! The generator hands each agent's quadratic program to a [`QpSolver`]:
//!
//! ```text
//! minimize    ½ xᵀ H x + fᵀ x
//! subject to  A x ≤ b,   A_eq x = b_eq
//! ```
//!
//! The backend is chosen from a closed set ([`SolverBackend`]) in the
//! configuration. The only backend today is OSQP, which expects the
//! `l ≤ A x ≤ u` form and an upper-triangular sparse `P`.

use crate::error::SolveError;
use nalgebra::{DMatrix, DVector};
use osqp::{CscMatrix, Problem, Settings};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Debug, Clone)]
pub struct QuadraticProblem {
    pub h: DMatrix<f64>,
    pub f: DVector<f64>,
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    pub a_eq: DMatrix<f64>,
    pub b_eq: DVector<f64>,
}

impl QuadraticProblem {
    pub fn num_vars(&self) -> usize {
        self.f.len()
    }

    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.h * x)) + self.f.dot(x)
    }

    /// Largest constraint violation of `x` (zero when feasible).
    pub fn max_violation(&self, x: &DVector<f64>) -> f64 {
        let ineq = (&self.a * x - &self.b).max().max(0.0);
        let eq = if self.a_eq.nrows() > 0 {
            (&self.a_eq * x - &self.b_eq).amax()
        } else {
            0.0
        };
        ineq.max(eq)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub x: DVector<f64>,
    pub cost: f64,
}

pub trait QpSolver: Send + Sync {
    fn solve(&self, qp: &QuadraticProblem) -> Result<Solution, SolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolverBackend {
    #[default]
    Osqp,
}

impl SolverBackend {
    pub fn build(&self) -> Box<dyn QpSolver> {
        match self {
            SolverBackend::Osqp => Box::new(OsqpSolver::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsqpSolver {
    pub eps_abs: f64,
    pub eps_rel: f64,
    pub max_iter: u32,
    /// Returned points violating a constraint by more than this are rejected.
    pub feasibility_tol: f64,
}

impl Default for OsqpSolver {
    fn default() -> Self {
        OsqpSolver {
            eps_abs: 1e-6,
            eps_rel: 1e-6,
            max_iter: 20000,
            feasibility_tol: 1e-3,
        }
    }
}

/// Dense to CSC, optionally keeping only the upper triangle.
fn to_csc(m: &DMatrix<f64>, upper_only: bool) -> CscMatrix<'static> {
    let mut data = Vec::new();
    let mut indices = Vec::new();
    let mut indptr = vec![0];

    for col in 0..m.ncols() {
        let last_row = if upper_only { (col + 1).min(m.nrows()) } else { m.nrows() };
        for row in 0..last_row {
            let value = m[(row, col)];
            if value != 0.0 {
                data.push(value);
                indices.push(row);
            }
        }
        indptr.push(data.len());
    }

    CscMatrix {
        nrows: m.nrows(),
        ncols: m.ncols(),
        indptr: Cow::Owned(indptr),
        indices: Cow::Owned(indices),
        data: Cow::Owned(data),
    }
}

impl QpSolver for OsqpSolver {
    fn solve(&self, qp: &QuadraticProblem) -> Result<Solution, SolveError> {
        let n = qp.num_vars();
        let m_in = qp.a.nrows();
        let m_eq = qp.a_eq.nrows();

        let symmetric = (&qp.h + qp.h.transpose()) * 0.5;
        let p_matrix = to_csc(&symmetric, true);

        let mut stacked = DMatrix::zeros(m_in + m_eq, n);
        stacked.rows_mut(0, m_in).copy_from(&qp.a);
        stacked.rows_mut(m_in, m_eq).copy_from(&qp.a_eq);
        let a_matrix = to_csc(&stacked, false);

        let mut l_bounds = vec![f64::NEG_INFINITY; m_in];
        let mut u_bounds = qp.b.as_slice().to_vec();
        l_bounds.extend_from_slice(qp.b_eq.as_slice());
        u_bounds.extend_from_slice(qp.b_eq.as_slice());

        let settings = Settings::default()
            .verbose(false)
            .eps_abs(self.eps_abs)
            .eps_rel(self.eps_rel)
            .max_iter(self.max_iter)
            .polishing(true);

        let mut problem = Problem::new(
            p_matrix,
            qp.f.as_slice(),
            a_matrix,
            &l_bounds,
            &u_bounds,
            &settings,
        )
        .map_err(|_| SolveError::NumericalFailure("OSQP setup rejected the problem".into()))?;

        let x = match &problem.solve() {
            osqp::Status::Solved(sol)
            | osqp::Status::SolvedInaccurate(sol)
            | osqp::Status::MaxIterationsReached(sol) => DVector::from_column_slice(sol.x()),
            osqp::Status::PrimalInfeasible(_) | osqp::Status::PrimalInfeasibleInaccurate(_) => {
                return Err(SolveError::Infeasible)
            }
            _ => {
                return Err(SolveError::NumericalFailure(
                    "OSQP terminated without a solution".into(),
                ))
            }
        };

        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolveError::NumericalFailure("non-finite solution".into()));
        }
        let violation = qp.max_violation(&x);
        if violation > self.feasibility_tol {
            return Err(SolveError::NumericalFailure(format!(
                "solution violates constraints by {:.3e}",
                violation
            )));
        }

        let cost = qp.objective(&x);
        Ok(Solution { x, cost })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// min (x - 1)² + (y - 2)²
    fn quadratic_bowl() -> (DMatrix<f64>, DVector<f64>) {
        (
            DMatrix::from_diagonal_element(2, 2, 2.0),
            DVector::from_vec(vec![-2.0, -4.0]),
        )
    }

    #[test]
    fn test_to_csc_upper_triangle() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.0, 2.0, 3.0, 4.0, 0.0, 4.0, 5.0]);
        let csc = to_csc(&m, true);
        assert_eq!(csc.indptr.as_ref(), &[0, 1, 3, 5]);
        assert_eq!(csc.indices.as_ref(), &[0, 0, 1, 1, 2]);
        assert_eq!(csc.data.as_ref(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_to_csc_full() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 3.0, 0.0, 2.0, 4.0]);
        let csc = to_csc(&m, false);
        assert_eq!(csc.nrows, 2);
        assert_eq!(csc.ncols, 3);
        assert_eq!(csc.indptr.as_ref(), &[0, 1, 2, 4]);
        assert_eq!(csc.indices.as_ref(), &[0, 1, 0, 1]);
        assert_eq!(csc.data.as_ref(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unconstrained_optimum_inside_bounds() {
        let (h, f) = quadratic_bowl();
        let qp = QuadraticProblem {
            h,
            f,
            a: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            b: DVector::from_vec(vec![10.0]),
            a_eq: DMatrix::zeros(0, 2),
            b_eq: DVector::zeros(0),
        };
        let sol = OsqpSolver::default().solve(&qp).unwrap();
        assert_relative_eq!(sol.x[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(sol.x[1], 2.0, epsilon = 1e-3);
        assert_relative_eq!(sol.cost, -5.0, epsilon = 1e-3);
    }

    #[test]
    fn test_active_inequality() {
        let (h, f) = quadratic_bowl();
        let qp = QuadraticProblem {
            h,
            f,
            a: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            b: DVector::from_vec(vec![2.0]),
            a_eq: DMatrix::zeros(0, 2),
            b_eq: DVector::zeros(0),
        };
        let sol = OsqpSolver::default().solve(&qp).unwrap();
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-3);
        assert_relative_eq!(sol.x[1], 1.5, epsilon = 1e-3);
        assert!(qp.max_violation(&sol.x) < 1e-3);
    }

    #[test]
    fn test_equality_constraint() {
        let qp = QuadraticProblem {
            h: DMatrix::from_diagonal_element(2, 2, 2.0),
            f: DVector::zeros(2),
            a: DMatrix::zeros(0, 2),
            b: DVector::zeros(0),
            a_eq: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            b_eq: DVector::from_vec(vec![1.0]),
        };
        let sol = OsqpSolver::default().solve(&qp).unwrap();
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-3);
        assert_relative_eq!(sol.x[1], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_infeasible_problem_is_reported() {
        let qp = QuadraticProblem {
            h: DMatrix::identity(1, 1),
            f: DVector::zeros(1),
            a: DMatrix::from_row_slice(1, 1, &[1.0]),
            b: DVector::from_vec(vec![0.0]),
            a_eq: DMatrix::from_row_slice(1, 1, &[1.0]),
            b_eq: DVector::from_vec(vec![1.0]),
        };
        assert_eq!(OsqpSolver::default().solve(&qp), Err(SolveError::Infeasible));
    }

    #[test]
    fn test_max_violation() {
        let qp = QuadraticProblem {
            h: DMatrix::identity(2, 2),
            f: DVector::zeros(2),
            a: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            b: DVector::from_vec(vec![1.0]),
            a_eq: DMatrix::from_row_slice(1, 2, &[0.0, 1.0]),
            b_eq: DVector::from_vec(vec![2.0]),
        };
        assert_relative_eq!(qp.max_violation(&DVector::from_vec(vec![0.0, 2.0])), 0.0);
        assert_relative_eq!(qp.max_violation(&DVector::from_vec(vec![1.5, 2.0])), 0.5);
        assert_relative_eq!(qp.max_violation(&DVector::from_vec(vec![0.0, 1.0])), 1.0);
    }

    #[test]
    fn test_backend_builds_osqp() {
        let solver = SolverBackend::default().build();
        let (h, f) = quadratic_bowl();
        let qp = QuadraticProblem {
            h,
            f,
            a: DMatrix::zeros(0, 2),
            b: DVector::zeros(0),
            a_eq: DMatrix::zeros(0, 2),
            b_eq: DVector::zeros(0),
        };
        assert!(solver.solve(&qp).is_ok());
    }
}
