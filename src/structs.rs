//! # Core Data Structures
//!
//! This module defines the fundamental data types used throughout the library:
//!
//! - **AgentState**: kinematic state of one agent at the current instant
//! - **Command**: one sample of the execution trajectory returned to the caller
//! - **PhysicalLimits / TuningParams / MpcParams**: immutable planning parameters
//! - **EllipseParams / Ellipse**: collision footprint of an agent or obstacle
//! - **Horizon**: predicted states of every agent over the planning window

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

/// Predicted states of one agent, `6 x k_hor`. Column `k` holds `[p; v]`
/// for `t + (k + 1) * h`.
pub type AgentHorizon = DMatrix<f64>;

/// One entry per agent (and per static obstacle, after the agents).
pub type Horizon = Vec<AgentHorizon>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
}

impl AgentState {
    pub fn new(position: Vector3<f64>, velocity: Vector3<f64>, acceleration: Vector3<f64>) -> Self {
        AgentState {
            position,
            velocity,
            acceleration,
        }
    }

    /// State at rest at `position`.
    pub fn at_rest(position: Vector3<f64>) -> Self {
        AgentState::new(position, Vector3::zeros(), Vector3::zeros())
    }

    /// `[p; v]` as used by the double integrator.
    pub fn pos_vel(&self) -> nalgebra::DVector<f64> {
        nalgebra::DVector::from_iterator(
            6,
            self.position.iter().chain(self.velocity.iter()).copied(),
        )
    }
}

/// A single execution sample, spaced `ts` apart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
}

impl Command {
    pub fn hold(state: &AgentState) -> Self {
        Command {
            position: state.position,
            velocity: state.velocity,
            acceleration: state.acceleration,
        }
    }

    /// The state an ideally tracking agent reaches after executing this sample.
    pub fn as_state(&self) -> AgentState {
        AgentState::new(self.position, self.velocity, self.acceleration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalLimits {
    pub pmin: Vector3<f64>,
    pub pmax: Vector3<f64>,
    pub amin: Vector3<f64>,
    pub amax: Vector3<f64>,
}

impl Default for PhysicalLimits {
    fn default() -> Self {
        PhysicalLimits {
            pmin: Vector3::new(-5.0, -5.0, 0.0),
            pmax: Vector3::new(5.0, 5.0, 5.0),
            amin: Vector3::new(-1.0, -1.0, -1.0),
            amax: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

/// Cost weights. A category with base weight `s` and decay exponent `spd`
/// weighs horizon step `k` (1-based) with `s * k^-spd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningParams {
    pub s_free: f64,
    pub s_obs: f64,
    pub s_repel: f64,
    pub spd_f: u32,
    pub spd_o: u32,
    pub spd_r: u32,
    pub lin_coll: f64,
    pub quad_coll: f64,
    pub energy_weights: Vector3<f64>,
    /// Speed at which the reference waypoints advance toward the goal [m/s].
    #[serde(default = "default_ref_speed")]
    pub ref_speed: f64,
}

fn default_ref_speed() -> f64 {
    1.0
}

impl Default for TuningParams {
    fn default() -> Self {
        TuningParams {
            s_free: 100.0,
            s_obs: 100.0,
            s_repel: 10.0,
            spd_f: 0,
            spd_o: 1,
            spd_r: 2,
            lin_coll: 1.0e4,
            quad_coll: 1.0e2,
            energy_weights: Vector3::new(1.0, 1.0, 1.0),
            ref_speed: default_ref_speed(),
        }
    }
}

impl TuningParams {
    pub fn step_weight(base: f64, spd: u32, step: usize) -> f64 {
        base * (step as f64).powi(-(spd as i32))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpcParams {
    pub h: f64,
    pub ts: f64,
    pub k_hor: usize,
    #[serde(default)]
    pub tuning: TuningParams,
    #[serde(default)]
    pub limits: PhysicalLimits,
}

impl Default for MpcParams {
    fn default() -> Self {
        MpcParams {
            h: 0.2,
            ts: 0.01,
            k_hor: 15,
            tuning: TuningParams::default(),
            limits: PhysicalLimits::default(),
        }
    }
}

impl MpcParams {
    /// Execution samples per planning step.
    pub fn samples_per_step(&self) -> usize {
        (self.h / self.ts).round() as usize
    }
}

/// Collision footprint: semi-axes `(radius, radius, radius * height_scaling)`
/// centred at `position + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipseParams {
    pub radius: f64,
    #[serde(default = "default_height_scaling")]
    pub height_scaling: f64,
    #[serde(default = "default_offset")]
    pub offset: Vector3<f64>,
}

fn default_height_scaling() -> f64 {
    1.0
}

fn default_offset() -> Vector3<f64> {
    Vector3::zeros()
}

impl Default for EllipseParams {
    fn default() -> Self {
        EllipseParams {
            radius: 0.3,
            height_scaling: 1.0,
            offset: Vector3::zeros(),
        }
    }
}

impl EllipseParams {
    pub fn semi_axes(&self) -> Vector3<f64> {
        Vector3::new(self.radius, self.radius, self.radius * self.height_scaling)
    }

    /// Combined clearance of a pair: the sum of both footprints per axis.
    pub fn combined_axes(&self, other: &EllipseParams) -> Vector3<f64> {
        self.semi_axes() + other.semi_axes()
    }
}

/// A placed collision shape, for visualization and logging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ellipse {
    pub agent_id: usize,
    pub center: Vector3<f64>,
    pub semi_axes: Vector3<f64>,
}

impl Ellipse {
    /// Normalized distance to `other`: below 1.0 the shapes overlap.
    pub fn normalized_distance(&self, other: &Ellipse) -> f64 {
        let axes = self.semi_axes + other.semi_axes;
        (self.center - other.center).component_div(&axes).norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_agent_state_pos_vel_layout() {
        let state = AgentState::new(
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(4.0, 5.0, 6.0),
            Vector3::new(7.0, 8.0, 9.0),
        );
        let x0 = state.pos_vel();
        assert_eq!(x0.len(), 6);
        assert_eq!(x0.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_command_round_trips_to_state() {
        let state = AgentState::new(
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(0.0, 0.1, 0.0),
        );
        assert_eq!(Command::hold(&state).as_state(), state);
    }

    #[test]
    fn test_step_weight_uniform_without_decay() {
        for k in 1..10 {
            assert_relative_eq!(TuningParams::step_weight(3.0, 0, k), 3.0);
        }
    }

    #[test]
    fn test_step_weight_decays_with_exponent() {
        assert_relative_eq!(TuningParams::step_weight(8.0, 1, 4), 2.0);
        assert_relative_eq!(TuningParams::step_weight(8.0, 2, 2), 2.0);
        assert!(TuningParams::step_weight(1.0, 3, 5) < TuningParams::step_weight(1.0, 3, 4));
    }

    #[test]
    fn test_samples_per_step() {
        let mpc = MpcParams {
            h: 0.2,
            ts: 0.01,
            ..MpcParams::default()
        };
        assert_eq!(mpc.samples_per_step(), 20);
    }

    #[test]
    fn test_ellipse_semi_axes() {
        let e = EllipseParams {
            radius: 0.5,
            height_scaling: 3.0,
            offset: Vector3::zeros(),
        };
        assert_eq!(e.semi_axes(), Vector3::new(0.5, 0.5, 1.5));
        assert_eq!(e.combined_axes(&e), Vector3::new(1.0, 1.0, 3.0));
    }

    #[test]
    fn test_ellipse_normalized_distance() {
        let a = Ellipse {
            agent_id: 0,
            center: Vector3::zeros(),
            semi_axes: Vector3::new(0.5, 0.5, 1.0),
        };
        let b = Ellipse {
            agent_id: 1,
            center: Vector3::new(2.0, 0.0, 0.0),
            semi_axes: Vector3::new(0.5, 0.5, 1.0),
        };
        assert_relative_eq!(a.normalized_distance(&b), 2.0);

        let above = Ellipse {
            center: Vector3::new(0.0, 0.0, 1.0),
            ..b
        };
        // Vertical clearance is 2.0, so 1.0 above is halfway in.
        assert_relative_eq!(a.normalized_distance(&above), 0.5);
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let json = r#"{ "h": 0.2, "ts": 0.02, "k_hor": 10 }"#;
        let mpc: MpcParams = serde_json::from_str(json).unwrap();
        assert_eq!(mpc.k_hor, 10);
        assert_eq!(mpc.tuning, TuningParams::default());
        assert_eq!(mpc.limits, PhysicalLimits::default());

        let e: EllipseParams = serde_json::from_str(r#"{ "radius": 0.4 }"#).unwrap();
        assert_eq!(e.height_scaling, 1.0);
        assert_eq!(e.offset, Vector3::zeros());
    }
}
