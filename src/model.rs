//! # Dynamics Model and State Propagators
//!
//! Agents are modelled as 3D double integrators with state `[p; v]` driven by
//! a commanded acceleration held constant over each sampling interval.
//!
//! A [`StatePropagator`] precomputes, for a fixed number of steps, the linear
//! maps from the initial state (`A0`), the sampled inputs (`Λ`) and the curve
//! control points (`Φ = Λ·Rho`) to the stacked state trajectory. Prediction
//! is then a pair of matrix-vector products.

use nalgebra::{DMatrix, DVector};

pub const STATE_DIM: usize = 6;
pub const INPUT_DIM: usize = 3;

#[derive(Debug, Clone)]
pub struct DoubleIntegrator3D {
    dt: f64,
    a: DMatrix<f64>,
    b: DMatrix<f64>,
}

impl DoubleIntegrator3D {
    pub fn new(dt: f64) -> Self {
        let mut a = DMatrix::identity(STATE_DIM, STATE_DIM);
        let mut b = DMatrix::zeros(STATE_DIM, INPUT_DIM);
        for axis in 0..INPUT_DIM {
            a[(axis, axis + 3)] = dt;
            b[(axis, axis)] = 0.5 * dt * dt;
            b[(axis + 3, axis)] = dt;
        }
        DoubleIntegrator3D { dt, a, b }
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DMatrix<f64> {
        &self.b
    }

    pub fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.a * x + &self.b * u
    }
}

#[derive(Debug, Clone)]
pub struct StatePropagator {
    steps: usize,
    lambda: DMatrix<f64>,
    a0: DMatrix<f64>,
    phi: DMatrix<f64>,
    phi_pos: DMatrix<f64>,
    a0_pos: DMatrix<f64>,
}

/// Keeps `len` rows out of every `stride`, starting at `offset`.
fn strided_rows(m: &DMatrix<f64>, stride: usize, offset: usize, len: usize) -> DMatrix<f64> {
    let blocks = m.nrows() / stride;
    let mut out = DMatrix::zeros(blocks * len, m.ncols());
    for k in 0..blocks {
        out.rows_mut(k * len, len)
            .copy_from(&m.rows(k * stride + offset, len));
    }
    out
}

impl StatePropagator {
    /// `rho` samples the input curve at the start of each of the `steps`
    /// intervals (`3 * steps` rows).
    pub fn new(model: &DoubleIntegrator3D, steps: usize, rho: &DMatrix<f64>) -> Self {
        debug_assert_eq!(
            rho.nrows(),
            INPUT_DIM * steps,
            "input sampling does not match step count"
        );

        let mut powers = Vec::with_capacity(steps + 1);
        powers.push(DMatrix::<f64>::identity(STATE_DIM, STATE_DIM));
        for k in 1..=steps {
            let next = model.a() * &powers[k - 1];
            powers.push(next);
        }

        let mut lambda = DMatrix::zeros(STATE_DIM * steps, INPUT_DIM * steps);
        let mut a0 = DMatrix::zeros(STATE_DIM * steps, STATE_DIM);
        for k in 0..steps {
            a0.view_mut((STATE_DIM * k, 0), (STATE_DIM, STATE_DIM))
                .copy_from(&powers[k + 1]);
            for j in 0..=k {
                let block = &powers[k - j] * model.b();
                lambda
                    .view_mut((STATE_DIM * k, INPUT_DIM * j), (STATE_DIM, INPUT_DIM))
                    .copy_from(&block);
            }
        }

        let phi = &lambda * rho;
        let phi_pos = strided_rows(&phi, STATE_DIM, 0, 3);
        let a0_pos = strided_rows(&a0, STATE_DIM, 0, 3);

        StatePropagator {
            steps,
            lambda,
            a0,
            phi,
            phi_pos,
            a0_pos,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn lambda(&self) -> &DMatrix<f64> {
        &self.lambda
    }

    pub fn a0(&self) -> &DMatrix<f64> {
        &self.a0
    }

    pub fn phi(&self) -> &DMatrix<f64> {
        &self.phi
    }

    /// Position rows of `Φ`, `3 * steps` x `n`.
    pub fn phi_pos(&self) -> &DMatrix<f64> {
        &self.phi_pos
    }

    /// Position rows of `A0`, `3 * steps` x 6.
    pub fn a0_pos(&self) -> &DMatrix<f64> {
        &self.a0_pos
    }

    /// Stacked states `x_1..x_steps` for the given initial state and control points.
    pub fn predict(&self, x0: &DVector<f64>, ctrl: &DVector<f64>) -> DVector<f64> {
        &self.phi * ctrl + &self.a0 * x0
    }

    /// Stacked positions only.
    pub fn predict_positions(&self, x0: &DVector<f64>, ctrl: &DVector<f64>) -> DVector<f64> {
        &self.phi_pos * ctrl + &self.a0_pos * x0
    }

    /// Same as [`predict`](Self::predict), reshaped to one state per column.
    pub fn predict_matrix(&self, x0: &DVector<f64>, ctrl: &DVector<f64>) -> DMatrix<f64> {
        let stacked = self.predict(x0, ctrl);
        DMatrix::from_column_slice(STATE_DIM, self.steps, stacked.as_slice())
    }
}
