//! # Collision Avoidance
//!
//! Pairwise avoidance between agents (and static obstacles) whose footprints
//! are axis-aligned ellipsoids. Two footprints with semi-axes `a_i`, `a_j`
//! overlap when the normalized distance
//!
//! ```text
//! ξ = ‖Θ⁻¹ (q_i − q_j)‖,   Θ = diag(a_i + a_j)
//! ```
//!
//! drops below 1, where `q` is the agent position plus its footprint offset.
//!
//! The true constraint `ξ ≥ 1` is non-convex. Every cycle it is replaced by a
//! half-space per pair and horizon step, computed from the previous cycle's
//! predictions `q̄`:
//!
//! - For a pair of agents, both sides use the same plane through the midpoint
//!   of `q̄_i` and `q̄_j`, with opposite normals, each claiming half of the
//!   clearance. If both agents honour their half-space, the pair is separated
//!   by at least the full clearance at that step.
//! - A static obstacle does not move, so the agent takes the full clearance on
//!   a plane tangent to the obstacle's clearance ellipsoid.
//!
//! ## Symmetry Breaking
//!
//! Two agents flying head-on at each other produce planes perpendicular to
//! their common line; each would stop in front of the other. The plane normal
//! is therefore tilted sideways by `PERTURBATION_EPSILON`, with the tilt
//! direction fixed by the pair's index order so both agents tilt the *same*
//! plane, and slide past each other in complementary directions.
//!
//! ## Regimes
//!
//! A pair whose minimum predicted `ξ` over the horizon is above the proximity
//! threshold contributes nothing (free flight). Otherwise the agent enters the
//! obstacle regime for this cycle: soft separation rows at every step (one
//! slack variable per neighbour) and a repulsion term at the steps that are
//! inside the proximity region.

use crate::structs::{AgentHorizon, Ellipse, EllipseParams, Horizon, TuningParams};
use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

const EPSILON: f64 = 1e-10;
/// Sideways tilt of separating planes, large enough to break exact symmetry
/// within a few cycles and small enough to keep planes close to the
/// perpendicular of the pair.
const PERTURBATION_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Free,
    Obstacle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvoiderKind {
    Ellipsoid,
    PotentialField,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvoiderParams {
    pub kind: AvoiderKind,
    /// Normalized distance below which a pair interacts.
    pub proximity: f64,
    /// Keep at most this many neighbours per agent, most imminent first.
    #[serde(default)]
    pub max_neighbors: Option<usize>,
}

impl Default for AvoiderParams {
    fn default() -> Self {
        AvoiderParams {
            kind: AvoiderKind::Ellipsoid,
            proximity: 1.5,
            max_neighbors: None,
        }
    }
}

/// Soft half-space on the position predicted at `step` (0-based):
/// `normal · p ≥ bound − ε[slack]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationRow {
    pub step: usize,
    pub normal: Vector3<f64>,
    pub bound: f64,
    pub slack: usize,
}

impl SeparationRow {
    pub fn margin(&self, position: &Vector3<f64>) -> f64 {
        self.normal.dot(position) - self.bound
    }
}

/// Quadratic pull `weight · ‖p_step − target‖²`.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionPenalty {
    pub step: usize,
    pub weight: f64,
    pub target: Vector3<f64>,
}

/// Linear cost `gradient · p_step`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepGradient {
    pub step: usize,
    pub gradient: Vector3<f64>,
}

/// Everything the avoider adds to one agent's QP, expressed on predicted
/// positions. The cost assembler maps it onto control points.
#[derive(Debug, Clone, PartialEq)]
pub struct AvoidanceTerms {
    pub regime: Regime,
    pub neighbors: Vec<usize>,
    pub separation: Vec<SeparationRow>,
    pub repulsion: Vec<StepGradient>,
    pub penalties: Vec<PositionPenalty>,
    pub num_slack: usize,
}

impl AvoidanceTerms {
    pub fn free() -> Self {
        AvoidanceTerms {
            regime: Regime::Free,
            neighbors: Vec::new(),
            separation: Vec::new(),
            repulsion: Vec::new(),
            penalties: Vec::new(),
            num_slack: 0,
        }
    }
}

pub trait Avoider: Send + Sync {
    /// Footprints placed at the given positions, one per body.
    fn compute_ellipses(&self, positions: &[Vector3<f64>]) -> Vec<Ellipse>;

    /// Avoidance contribution for `agent_id`, computed from last cycle's
    /// predictions of every body. Never reads the current cycle's results.
    fn compute_avoidance_cost(&self, agent_id: usize, old_horizon: &Horizon) -> AvoidanceTerms;
}

pub fn build_avoider(
    params: &AvoiderParams,
    ellipses: Vec<EllipseParams>,
    num_agents: usize,
    tuning: &TuningParams,
) -> Box<dyn Avoider> {
    let geometry = PairGeometry {
        ellipses,
        num_agents,
        proximity: params.proximity,
        max_neighbors: params.max_neighbors,
        s_repel: tuning.s_repel,
        spd_r: tuning.spd_r,
    };
    match params.kind {
        AvoiderKind::Ellipsoid => Box::new(EllipsoidAvoider { geometry }),
        AvoiderKind::PotentialField => Box::new(PotentialFieldAvoider { geometry }),
    }
}

fn horizon_position(h: &AgentHorizon, step: usize) -> Vector3<f64> {
    Vector3::new(h[(0, step)], h[(1, step)], h[(2, step)])
}

/// Separation direction of one pair at one step, in normalized coordinates.
#[derive(Debug, Clone, Copy)]
struct PairStep {
    /// Unit normal pointing from the other body toward this agent.
    normal: Vector3<f64>,
    /// Point the plane passes through (offset-adjusted positions).
    anchor: Vector3<f64>,
    /// Fraction of the clearance this agent is responsible for.
    share: f64,
    distance: f64,
}

/// Shared geometry for both avoider variants.
#[derive(Debug, Clone)]
struct PairGeometry {
    ellipses: Vec<EllipseParams>,
    num_agents: usize,
    proximity: f64,
    max_neighbors: Option<usize>,
    s_repel: f64,
    spd_r: u32,
}

impl PairGeometry {
    fn theta(&self, i: usize, j: usize) -> Vector3<f64> {
        self.ellipses[i].combined_axes(&self.ellipses[j])
    }

    fn center(&self, body: usize, h: &Horizon, step: usize) -> Vector3<f64> {
        horizon_position(&h[body], step) + self.ellipses[body].offset
    }

    fn pair_step(&self, i: usize, j: usize, h: &Horizon, step: usize) -> PairStep {
        let theta = self.theta(i, j);
        let qi = self.center(i, h, step);
        let qj = self.center(j, h, step);
        let distance = (qi - qj).component_div(&theta).norm();

        if j >= self.num_agents {
            let normal = tilted_normal((qi - qj).component_div(&theta), i < j);
            return PairStep {
                normal,
                anchor: qj,
                share: 1.0,
                distance,
            };
        }

        // Canonical orientation from the lower to the higher index, so both
        // agents of the pair build the same plane.
        let (lo, hi, sign) = if i < j { (qi, qj, 1.0) } else { (qj, qi, -1.0) };
        let normal = tilted_normal((lo - hi).component_div(&theta), true) * sign;
        PairStep {
            normal,
            anchor: (qi + qj) * 0.5,
            share: 0.5,
            distance,
        }
    }

    /// Neighbours within the proximity threshold at some step, most imminent
    /// first, truncated to `max_neighbors` and returned in index order.
    fn conflicting_neighbors(&self, agent_id: usize, h: &Horizon) -> Vec<usize> {
        let steps = h[agent_id].ncols();
        let mut queue = PriorityQueue::new();

        for j in 0..h.len() {
            if j == agent_id {
                continue;
            }
            let theta = self.theta(agent_id, j);
            let mut first_step = None;
            let mut min_distance = f64::INFINITY;
            for k in 0..steps {
                let d = (self.center(agent_id, h, k) - self.center(j, h, k))
                    .component_div(&theta)
                    .norm();
                if d < self.proximity && first_step.is_none() {
                    first_step = Some(k);
                }
                min_distance = min_distance.min(d);
            }
            if let Some(k) = first_step {
                queue.push(j, Reverse((k, OrderedFloat(min_distance), j)));
            }
        }

        let limit = self.max_neighbors.unwrap_or(usize::MAX);
        let mut selected = Vec::new();
        while let Some((j, _)) = queue.pop() {
            if selected.len() >= limit {
                break;
            }
            selected.push(j);
        }
        selected.sort_unstable();
        selected
    }

    fn repulsion_weight(&self, step: usize) -> f64 {
        TuningParams::step_weight(self.s_repel, self.spd_r, step + 1)
    }
}

/// Unit vector along `direction`, tilted sideways in the horizontal plane.
/// `positive` selects the tilt side; a degenerate direction falls back to +x.
fn tilted_normal(direction: Vector3<f64>, positive: bool) -> Vector3<f64> {
    let nu = if direction.norm() > EPSILON {
        direction.normalize()
    } else {
        Vector3::x()
    };
    let horizontal = Vector3::new(-nu.y, nu.x, 0.0);
    let side = if horizontal.norm() > EPSILON {
        horizontal.normalize()
    } else {
        Vector3::y()
    };
    let side = if positive { side } else { -side };
    (nu + side * PERTURBATION_EPSILON).normalize()
}

/// Separating-hyperplane avoider: soft half-space constraints plus repulsion.
#[derive(Debug, Clone)]
pub struct EllipsoidAvoider {
    geometry: PairGeometry,
}

impl Avoider for EllipsoidAvoider {
    fn compute_ellipses(&self, positions: &[Vector3<f64>]) -> Vec<Ellipse> {
        place_ellipses(&self.geometry.ellipses, positions)
    }

    fn compute_avoidance_cost(&self, agent_id: usize, old_horizon: &Horizon) -> AvoidanceTerms {
        let g = &self.geometry;
        let neighbors = g.conflicting_neighbors(agent_id, old_horizon);
        if neighbors.is_empty() {
            return AvoidanceTerms::free();
        }

        let steps = old_horizon[agent_id].ncols();
        let offset = g.ellipses[agent_id].offset;
        let mut separation = Vec::with_capacity(neighbors.len() * steps);
        let mut repulsion = Vec::new();

        for (slack, &j) in neighbors.iter().enumerate() {
            let theta = g.theta(agent_id, j);
            for k in 0..steps {
                let pair = g.pair_step(agent_id, j, old_horizon, k);
                // Θ⁻¹ normal acting on raw positions.
                let normal = pair.normal.component_div(&theta);
                separation.push(SeparationRow {
                    step: k,
                    normal,
                    bound: pair.share + normal.dot(&(pair.anchor - offset)),
                    slack,
                });
                if pair.distance < g.proximity {
                    repulsion.push(StepGradient {
                        step: k,
                        gradient: -normal * g.repulsion_weight(k),
                    });
                }
            }
        }

        AvoidanceTerms {
            regime: Regime::Obstacle,
            num_slack: neighbors.len(),
            neighbors,
            separation,
            repulsion,
            penalties: Vec::new(),
        }
    }
}

/// Penalty-only avoider: pulls positions that are inside the proximity region
/// out to its boundary. No constraints are added, so it never makes a QP
/// infeasible, at the price of weaker separation guarantees.
#[derive(Debug, Clone)]
pub struct PotentialFieldAvoider {
    geometry: PairGeometry,
}

impl Avoider for PotentialFieldAvoider {
    fn compute_ellipses(&self, positions: &[Vector3<f64>]) -> Vec<Ellipse> {
        place_ellipses(&self.geometry.ellipses, positions)
    }

    fn compute_avoidance_cost(&self, agent_id: usize, old_horizon: &Horizon) -> AvoidanceTerms {
        let g = &self.geometry;
        let neighbors = g.conflicting_neighbors(agent_id, old_horizon);
        if neighbors.is_empty() {
            return AvoidanceTerms::free();
        }

        let steps = old_horizon[agent_id].ncols();
        let offset = g.ellipses[agent_id].offset;
        let mut penalties = Vec::new();
        for &j in &neighbors {
            let theta = g.theta(agent_id, j);
            for k in 0..steps {
                let pair = g.pair_step(agent_id, j, old_horizon, k);
                if pair.distance >= g.proximity {
                    continue;
                }
                let other = g.center(j, old_horizon, k);
                let target = other + pair.normal.component_mul(&theta) * g.proximity - offset;
                penalties.push(PositionPenalty {
                    step: k,
                    weight: g.repulsion_weight(k),
                    target,
                });
            }
        }

        AvoidanceTerms {
            regime: Regime::Obstacle,
            neighbors,
            separation: Vec::new(),
            repulsion: Vec::new(),
            penalties,
            num_slack: 0,
        }
    }
}

fn place_ellipses(params: &[EllipseParams], positions: &[Vector3<f64>]) -> Vec<Ellipse> {
    params
        .iter()
        .zip(positions)
        .enumerate()
        .map(|(agent_id, (e, p))| Ellipse {
            agent_id,
            center: p + e.offset,
            semi_axes: e.semi_axes(),
        })
        .collect()
}
