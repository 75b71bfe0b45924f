//! # Trajectory Generator
//!
//! Receding-horizon planner for the whole fleet. Every call to
//! [`Generator::next_inputs`] runs one planning cycle:
//!
//! 1. Each cluster worker takes its agents in order and, per agent, advances
//!    the reference toward the goal, assembles the QP (tracking, energy,
//!    limits and collision terms computed from the *previous* cycle's
//!    predictions), solves it, stores the new predicted horizon and samples
//!    the execution commands at `ts`.
//! 2. Once all workers have joined, the freshly written horizon becomes the
//!    snapshot read by the next cycle.
//!
//! Agents within one cycle never see each other's new plans, so results do not
//! depend on how the fleet is clustered.
//!
//! A failed solve is absorbed per agent: the previous prediction is shifted
//! forward one step and the previous cycle's last command is repeated.

use crate::avoidance::{build_avoider, Avoider};
use crate::bezier::BezierCurve;
use crate::cluster::{partition, run_clusters};
use crate::config::GeneratorParams;
use crate::cost::CostAssembler;
use crate::error::GeneratorError;
use crate::model::{DoubleIntegrator3D, StatePropagator, INPUT_DIM, STATE_DIM};
use crate::solver::QpSolver;
use crate::stats::{SolveRecord, SolveStatus, StatsSink};
use crate::structs::{AgentHorizon, AgentState, Command, Ellipse, Horizon};
use nalgebra::{DMatrix, DVector, Vector3};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-agent state carried from one cycle to the next.
#[derive(Debug, Clone)]
struct AgentPlan {
    goal: Vector3<f64>,
    /// `3 x k_hor` waypoints, column `k` for `t + (k + 1) h`.
    reference: DMatrix<f64>,
    last_command: Command,
}

/// Everything one agent's solve is allowed to write.
struct AgentSlot<'a> {
    horizon: &'a mut AgentHorizon,
    plan: &'a mut AgentPlan,
    commands: &'a mut Vec<Command>,
}

/// Read-only view shared by all workers during one cycle.
struct CycleContext<'a> {
    cycle: u64,
    model: &'a DoubleIntegrator3D,
    prediction: &'a StatePropagator,
    execution: &'a StatePropagator,
    exec_accel: &'a DMatrix<f64>,
    cost: &'a CostAssembler,
    avoider: &'a dyn Avoider,
    solver: &'a dyn QpSolver,
    old_horizon: &'a Horizon,
    stats: &'a StatsSink,
    ref_step: f64,
}

pub struct Generator {
    params: GeneratorParams,
    model: DoubleIntegrator3D,
    prediction: StatePropagator,
    execution: StatePropagator,
    /// Curve value at `j ts`, `j = 1..=h/ts`.
    exec_accel: DMatrix<f64>,
    cost: CostAssembler,
    avoider: Box<dyn Avoider>,
    solver: Box<dyn QpSolver>,
    clusters: Vec<Vec<usize>>,
    old_horizon: Horizon,
    new_horizon: Horizon,
    plans: Vec<AgentPlan>,
    stats: StatsSink,
    cycle: u64,
}

/// Drops the first column and appends a zero-input step past the last one.
fn shift_horizon(horizon: &AgentHorizon, model: &DoubleIntegrator3D) -> AgentHorizon {
    let steps = horizon.ncols();
    let mut shifted = DMatrix::zeros(STATE_DIM, steps);
    if steps > 1 {
        shifted
            .columns_mut(0, steps - 1)
            .copy_from(&horizon.columns(1, steps - 1));
    }
    let last = horizon.column(steps - 1).into_owned();
    let next = model.step(&last, &DVector::zeros(INPUT_DIM));
    shifted.set_column(steps - 1, &next);
    shifted
}

/// Re-anchors the reference and spaces `step` metres between waypoints,
/// stopping at the goal. The anchor is the previous first waypoint while the
/// agent keeps up with it, otherwise the agent's position.
fn advance_reference(
    reference: &mut DMatrix<f64>,
    position: &Vector3<f64>,
    goal: &Vector3<f64>,
    step: f64,
) {
    let first = Vector3::new(reference[(0, 0)], reference[(1, 0)], reference[(2, 0)]);
    let anchor = if (first - position).norm() <= step {
        first
    } else {
        *position
    };
    let to_goal = goal - anchor;
    let distance = to_goal.norm();
    for k in 0..reference.ncols() {
        let reach = (k + 1) as f64 * step;
        let waypoint = if distance <= reach {
            *goal
        } else {
            anchor + to_goal * (reach / distance)
        };
        reference.set_column(k, &waypoint);
    }
}

fn at_rest_horizon(position: &Vector3<f64>, steps: usize) -> AgentHorizon {
    DMatrix::from_fn(STATE_DIM, steps, |r, _| if r < 3 { position[r] } else { 0.0 })
}

impl CycleContext<'_> {
    fn plan(&self, agent: usize, state: &AgentState, slot: &mut AgentSlot<'_>) {
        let x0 = state.pos_vel();
        advance_reference(
            &mut slot.plan.reference,
            &state.position,
            &slot.plan.goal,
            self.ref_step,
        );

        let terms = self.avoider.compute_avoidance_cost(agent, self.old_horizon);
        let qp = self
            .cost
            .build_qp(&x0, &slot.plan.reference, &state.acceleration, &terms);

        let started = Instant::now();
        let result = self.solver.solve(&qp);
        let solve_time_ms = started.elapsed().as_secs_f64() * 1e3;

        let (status, cost) = match result {
            Ok(solution) => {
                let ctrl = solution.x.rows(0, self.cost.num_vars()).into_owned();
                let predicted = self.prediction.predict_matrix(&x0, &ctrl);
                *slot.horizon = shift_horizon(&predicted, self.model);
                *slot.commands = self.sample_commands(&x0, &ctrl);
                debug!(
                    cycle = self.cycle,
                    agent,
                    cost = solution.cost,
                    regime = ?terms.regime,
                    neighbors = terms.neighbors.len(),
                    solve_time_ms,
                    "agent solved"
                );
                (SolveStatus::Solved, Some(solution.cost))
            }
            Err(err) => {
                warn!(
                    cycle = self.cycle,
                    agent,
                    error = %err,
                    "solve failed, repeating previous plan"
                );
                *slot.horizon = shift_horizon(&self.old_horizon[agent], self.model);
                *slot.commands = vec![slot.plan.last_command; self.execution.steps()];
                (SolveStatus::from(&err), None)
            }
        };

        if let Some(&last) = slot.commands.last() {
            slot.plan.last_command = last;
        }

        self.stats.record(SolveRecord {
            cycle: self.cycle,
            agent_id: agent,
            status,
            cost,
            solve_time_ms,
            regime: terms.regime,
            neighbors: terms.neighbors.len(),
        });
    }

    fn sample_commands(&self, x0: &DVector<f64>, ctrl: &DVector<f64>) -> Vec<Command> {
        let states = self.execution.predict_matrix(x0, ctrl);
        let accel = self.exec_accel * ctrl;
        (0..self.execution.steps())
            .map(|j| Command {
                position: Vector3::new(states[(0, j)], states[(1, j)], states[(2, j)]),
                velocity: Vector3::new(states[(3, j)], states[(4, j)], states[(5, j)]),
                acceleration: Vector3::new(accel[3 * j], accel[3 * j + 1], accel[3 * j + 2]),
            })
            .collect()
    }
}

impl Generator {
    /// Builds a generator with the solver backend named in `params`.
    pub fn new(params: GeneratorParams) -> Result<Self, GeneratorError> {
        let solver = params.solver.build();
        Self::with_solver(params, solver)
    }

    pub fn with_solver(
        params: GeneratorParams,
        solver: Box<dyn QpSolver>,
    ) -> Result<Self, GeneratorError> {
        params.validate()?;

        let mpc = &params.mpc;
        let k_hor = mpc.k_hor;
        let samples = mpc.samples_per_step();
        let curve = BezierCurve::new(params.bezier);

        let model = DoubleIntegrator3D::new(mpc.h);
        let coarse: Vec<f64> = (0..k_hor).map(|k| k as f64 * mpc.h).collect();
        let prediction = StatePropagator::new(&model, k_hor, &curve.sampling_matrix(&coarse));

        let fine: Vec<f64> = (0..samples).map(|j| j as f64 * mpc.ts).collect();
        let execution = StatePropagator::new(
            &DoubleIntegrator3D::new(mpc.ts),
            samples,
            &curve.sampling_matrix(&fine),
        );
        let sample_times: Vec<f64> = (1..=samples).map(|j| j as f64 * mpc.ts).collect();
        let exec_accel = curve.sampling_matrix(&sample_times);

        let cost = CostAssembler::new(&curve, &prediction, mpc);

        let num_agents = params.num_agents();
        let footprints = params
            .agents
            .iter()
            .map(|a| a.ellipse)
            .chain(params.obstacles.iter().map(|o| o.ellipse))
            .collect();
        let avoider = build_avoider(&params.avoider, footprints, num_agents, &mpc.tuning);

        let old_horizon: Horizon = params
            .agents
            .iter()
            .map(|a| at_rest_horizon(&a.initial, k_hor))
            .chain(
                params
                    .obstacles
                    .iter()
                    .map(|o| at_rest_horizon(&o.position, k_hor)),
            )
            .collect();
        let plans = params
            .agents
            .iter()
            .map(|a| AgentPlan {
                goal: a.goal,
                reference: DMatrix::from_fn(3, k_hor, |r, _| a.initial[r]),
                last_command: Command::hold(&AgentState::at_rest(a.initial)),
            })
            .collect();
        let clusters = partition(num_agents, params.max_clusters);

        info!(
            agents = num_agents,
            obstacles = params.obstacles.len(),
            clusters = clusters.len(),
            variables = curve.num_vars(),
            k_hor,
            samples,
            "trajectory generator ready"
        );

        Ok(Generator {
            model,
            prediction,
            execution,
            exec_accel,
            cost,
            avoider,
            solver,
            clusters,
            new_horizon: old_horizon.clone(),
            old_horizon,
            plans,
            stats: StatsSink::new(),
            cycle: 0,
            params,
        })
    }

    /// Plans one cycle for the whole fleet and returns, per agent, the
    /// commands for the next `h` seconds (`h / ts` samples at `j ts`,
    /// `j = 1..=h/ts`).
    pub fn next_inputs(
        &mut self,
        states: &[AgentState],
    ) -> Result<Vec<Vec<Command>>, GeneratorError> {
        let num_agents = self.num_agents();
        if states.len() != num_agents {
            return Err(GeneratorError::DimensionMismatch {
                expected: num_agents,
                got: states.len(),
            });
        }

        let mut outputs = vec![Vec::new(); num_agents];
        let context = CycleContext {
            cycle: self.cycle,
            model: &self.model,
            prediction: &self.prediction,
            execution: &self.execution,
            exec_accel: &self.exec_accel,
            cost: &self.cost,
            avoider: self.avoider.as_ref(),
            solver: self.solver.as_ref(),
            old_horizon: &self.old_horizon,
            stats: &self.stats,
            ref_step: self.params.mpc.tuning.ref_speed * self.params.mpc.h,
        };
        let mut slots: Vec<AgentSlot<'_>> = self
            .new_horizon
            .iter_mut()
            .zip(self.plans.iter_mut())
            .zip(outputs.iter_mut())
            .map(|((horizon, plan), commands)| AgentSlot {
                horizon,
                plan,
                commands,
            })
            .collect();

        run_clusters(&self.clusters, &mut slots, |agent, slot| {
            context.plan(agent, &states[agent], slot)
        });

        std::mem::swap(&mut self.old_horizon, &mut self.new_horizon);
        self.cycle += 1;
        Ok(outputs)
    }

    /// Collision footprints of every agent at its last commanded position,
    /// followed by the static obstacles.
    pub fn ellipses(&self) -> Vec<Ellipse> {
        let positions: Vec<Vector3<f64>> = self
            .plans
            .iter()
            .map(|p| p.last_command.position)
            .chain(
                self.old_horizon[self.plans.len()..]
                    .iter()
                    .map(|h| Vector3::new(h[(0, 0)], h[(1, 0)], h[(2, 0)])),
            )
            .collect();
        self.avoider.compute_ellipses(&positions)
    }

    pub fn stats(&self) -> &StatsSink {
        &self.stats
    }

    /// Predictions from the last completed cycle, agents then obstacles.
    pub fn old_horizon(&self) -> &Horizon {
        &self.old_horizon
    }

    pub fn reference(&self, agent: usize) -> Option<&DMatrix<f64>> {
        self.plans.get(agent).map(|p| &p.reference)
    }

    pub fn params(&self) -> &GeneratorParams {
        &self.params
    }

    pub fn num_agents(&self) -> usize {
        self.plans.len()
    }

    pub fn clusters(&self) -> &[Vec<usize>] {
        &self.clusters
    }

    /// Number of completed cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}
