//! # DMPC Core
//!
//! Distributed model predictive control for fleets of 3D point-mass agents.
//!
//! Every control cycle each agent solves a small quadratic program over the
//! control points of a piecewise Bezier acceleration curve: track a reference
//! toward its goal, spend little control effort, stay inside the workspace and
//! acceleration limits, and keep an ellipsoidal clearance from the other
//! agents' and obstacles' predicted positions. The fleet is partitioned into
//! clusters solved in parallel.
//!
//! ## Modules
//!
//! - **bezier / model**: curve basis and double-integrator propagators
//! - **cost / avoidance**: QP assembly and collision terms
//! - **solver**: QP backend adapter (OSQP)
//! - **cluster / generator**: per-cycle orchestration
//!
//! ## Usage
//!
//! Build a [`Generator`] from [`GeneratorParams`] and call
//! [`Generator::next_inputs`] once per cycle with the fleet's current states.
//! Python bindings are available behind the `python` feature.

pub mod avoidance;
pub mod bezier;
pub mod cluster;
pub mod config;
pub mod cost;
pub mod error;
pub mod generator;
pub mod model;
pub mod solver;
pub mod stats;
pub mod structs;

#[cfg(feature = "python")]
mod python;

pub use avoidance::{AvoiderKind, AvoiderParams, Regime};
pub use bezier::BezierParams;
pub use config::{AgentConfig, GeneratorParams, ObstacleConfig};
pub use error::{ConfigError, GeneratorError, SolveError};
pub use generator::Generator;
pub use solver::{QpSolver, QuadraticProblem, Solution, SolverBackend};
pub use stats::{SolveRecord, SolveStatus, StatsSink, StatsSummary};
pub use structs::{
    AgentState, Command, Ellipse, EllipseParams, MpcParams, PhysicalLimits, TuningParams,
};
