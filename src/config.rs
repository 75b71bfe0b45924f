//! Generator configuration: the whole parameter bundle, loadable from JSON and
//! checked once before any matrix is built.

use crate::avoidance::AvoiderParams;
use crate::bezier::BezierParams;
use crate::error::ConfigError;
use crate::solver::SolverBackend;
use crate::structs::{EllipseParams, MpcParams};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Relative tolerance for the timing consistency checks.
const TIMING_TOL: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub initial: Vector3<f64>,
    pub goal: Vector3<f64>,
    #[serde(default)]
    pub ellipse: EllipseParams,
}

/// A body that never moves and is avoided by every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleConfig {
    pub position: Vector3<f64>,
    #[serde(default)]
    pub ellipse: EllipseParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorParams {
    #[serde(default)]
    pub bezier: BezierParams,
    #[serde(default)]
    pub mpc: MpcParams,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub obstacles: Vec<ObstacleConfig>,
    #[serde(default)]
    pub avoider: AvoiderParams,
    #[serde(default)]
    pub solver: SolverBackend,
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
}

fn default_max_clusters() -> usize {
    4
}

impl GeneratorParams {
    pub fn new(bezier: BezierParams, mpc: MpcParams, agents: Vec<AgentConfig>) -> Self {
        GeneratorParams {
            bezier,
            mpc,
            agents,
            obstacles: Vec::new(),
            avoider: AvoiderParams::default(),
            solver: SolverBackend::default(),
            max_clusters: default_max_clusters(),
        }
    }

    /// Builds the agent list from parallel lists. `ellipses` holds either one
    /// footprint per agent or a single footprint shared by all of them.
    pub fn fleet(
        initial: &[Vector3<f64>],
        goals: &[Vector3<f64>],
        ellipses: &[EllipseParams],
    ) -> Result<Vec<AgentConfig>, ConfigError> {
        if goals.len() != initial.len() {
            return Err(ConfigError::CountMismatch {
                what: "goals",
                expected: initial.len(),
                got: goals.len(),
            });
        }
        if ellipses.len() != 1 && ellipses.len() != initial.len() {
            return Err(ConfigError::CountMismatch {
                what: "ellipses",
                expected: initial.len(),
                got: ellipses.len(),
            });
        }

        Ok(initial
            .iter()
            .zip(goals)
            .enumerate()
            .map(|(i, (&initial, &goal))| AgentConfig {
                initial,
                goal,
                ellipse: ellipses[if ellipses.len() == 1 { 0 } else { i }],
            })
            .collect())
    }

    pub fn num_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mpc = &self.mpc;
        if mpc.h <= 0.0 {
            return Err(ConfigError::invalid("mpc.h", format!("must be positive, got {}", mpc.h)));
        }
        if mpc.ts <= 0.0 {
            return Err(ConfigError::invalid("mpc.ts", format!("must be positive, got {}", mpc.ts)));
        }
        let ratio = mpc.h / mpc.ts;
        if mpc.ts > mpc.h || (ratio - ratio.round()).abs() > TIMING_TOL * ratio {
            return Err(ConfigError::SamplingMismatch { h: mpc.h, ts: mpc.ts });
        }
        if mpc.k_hor == 0 {
            return Err(ConfigError::invalid("mpc.k_hor", "must be at least 1"));
        }

        let bz = &self.bezier;
        if bz.num_segments == 0 {
            return Err(ConfigError::invalid("bezier.num_segments", "must be at least 1"));
        }
        if bz.t_segment <= 0.0 {
            return Err(ConfigError::invalid("bezier.t_segment", "must be positive"));
        }
        if bz.deg_poly >= bz.deg {
            return Err(ConfigError::invalid(
                "bezier.deg_poly",
                format!("must be below the degree {}, got {}", bz.deg, bz.deg_poly),
            ));
        }
        let curve = bz.num_segments as f64 * bz.t_segment;
        let horizon = mpc.k_hor as f64 * mpc.h;
        if (curve - horizon).abs() > TIMING_TOL * horizon.max(1.0) {
            return Err(ConfigError::HorizonMismatch { curve, horizon });
        }

        let limits = &mpc.limits;
        for axis in 0..3 {
            if limits.pmin[axis] >= limits.pmax[axis] {
                return Err(ConfigError::invalid(
                    "limits.pmin",
                    format!("axis {} lower bound is not below upper bound", axis),
                ));
            }
            if limits.amin[axis] >= limits.amax[axis] {
                return Err(ConfigError::invalid(
                    "limits.amin",
                    format!("axis {} lower bound is not below upper bound", axis),
                ));
            }
        }

        let tuning = &mpc.tuning;
        if tuning.ref_speed <= 0.0 {
            return Err(ConfigError::invalid("tuning.ref_speed", "must be positive"));
        }
        let weights = [
            tuning.s_free,
            tuning.s_obs,
            tuning.s_repel,
            tuning.lin_coll,
            tuning.quad_coll,
        ];
        if weights.iter().chain(tuning.energy_weights.iter()).any(|&w| w < 0.0) {
            return Err(ConfigError::invalid("tuning", "weights must be non-negative"));
        }

        if self.avoider.proximity <= 0.0 {
            return Err(ConfigError::invalid("avoider.proximity", "must be positive"));
        }
        if self.max_clusters == 0 {
            return Err(ConfigError::invalid("max_clusters", "must be at least 1"));
        }

        if self.agents.is_empty() {
            return Err(ConfigError::EmptyFleet);
        }
        let shapes = self
            .agents
            .iter()
            .map(|a| &a.ellipse)
            .chain(self.obstacles.iter().map(|o| &o.ellipse));
        for e in shapes {
            if e.radius <= 0.0 {
                return Err(ConfigError::invalid(
                    "ellipse.radius",
                    format!("must be positive, got {}", e.radius),
                ));
            }
            if e.height_scaling <= 0.0 {
                return Err(ConfigError::invalid("ellipse.height_scaling", "must be positive"));
            }
        }
        Ok(())
    }

    /// Parse from a JSON string and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        let params: Self = serde_json::from_reader(reader)?;
        params.validate()?;
        Ok(params)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> GeneratorParams {
        let agents = GeneratorParams::fleet(
            &[Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 1.0)],
            &[Vector3::new(1.0, 1.0, 1.0), Vector3::new(0.0, 1.0, 1.0)],
            &[EllipseParams::default()],
        )
        .unwrap();
        GeneratorParams::new(BezierParams::default(), MpcParams::default(), agents)
    }

    #[test]
    fn test_defaults_are_consistent() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_fleet_broadcasts_single_ellipse() {
        let params = valid();
        assert_eq!(params.num_agents(), 2);
        assert_eq!(params.agents[1].ellipse, EllipseParams::default());
    }

    #[test]
    fn test_fleet_count_mismatch() {
        let err = GeneratorParams::fleet(
            &[Vector3::zeros(); 3],
            &[Vector3::zeros(); 2],
            &[EllipseParams::default()],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CountMismatch {
                what: "goals",
                expected: 3,
                got: 2
            }
        ));

        let err = GeneratorParams::fleet(
            &[Vector3::zeros(); 3],
            &[Vector3::zeros(); 3],
            &[EllipseParams::default(); 2],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::CountMismatch { what: "ellipses", .. }));
    }

    #[test]
    fn test_rejects_bad_timing() {
        let mut p = valid();
        p.mpc.h = 0.0;
        assert!(matches!(p.validate(), Err(ConfigError::InvalidValue { field: "mpc.h", .. })));

        let mut p = valid();
        p.mpc.ts = -0.01;
        assert!(matches!(p.validate(), Err(ConfigError::InvalidValue { field: "mpc.ts", .. })));

        let mut p = valid();
        p.mpc.ts = 0.3;
        assert!(matches!(p.validate(), Err(ConfigError::SamplingMismatch { .. })));

        let mut p = valid();
        p.mpc.ts = 0.03;
        assert!(matches!(p.validate(), Err(ConfigError::SamplingMismatch { .. })));

        let mut p = valid();
        p.mpc.k_hor = 0;
        assert!(matches!(p.validate(), Err(ConfigError::InvalidValue { field: "mpc.k_hor", .. })));
    }

    #[test]
    fn test_rejects_curve_horizon_mismatch() {
        let mut p = valid();
        p.mpc.k_hor = 10;
        assert!(matches!(p.validate(), Err(ConfigError::HorizonMismatch { .. })));
    }

    #[test]
    fn test_rejects_continuity_order() {
        let mut p = valid();
        p.bezier.deg_poly = p.bezier.deg;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidValue { field: "bezier.deg_poly", .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_limits() {
        let mut p = valid();
        p.mpc.limits.pmin.x = 6.0;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidValue {
                field: "limits.pmin",
                ..
            })
        ));

        let mut p = valid();
        p.mpc.limits.amax.z = -2.0;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidValue {
                field: "limits.amin",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_empty_fleet_and_bad_shapes() {
        let mut p = valid();
        p.agents.clear();
        assert!(matches!(p.validate(), Err(ConfigError::EmptyFleet)));

        let mut p = valid();
        p.agents[0].ellipse.radius = 0.0;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidValue {
                field: "ellipse.radius",
                ..
            })
        ));

        let mut p = valid();
        p.obstacles.push(ObstacleConfig {
            position: Vector3::zeros(),
            ellipse: EllipseParams {
                radius: -1.0,
                ..EllipseParams::default()
            },
        });
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidValue {
                field: "ellipse.radius",
                ..
            })
        ));
    }

    #[test]
    fn test_from_json_with_defaults() {
        let json = r#"{
            "agents": [
                { "initial": [0.0, 0.0, 1.0], "goal": [1.0, 0.0, 1.0] },
                {
                    "initial": [2.0, 0.0, 1.0],
                    "goal": [0.0, 0.0, 1.0],
                    "ellipse": { "radius": 0.2 }
                }
            ],
            "obstacles": [ { "position": [1.0, 2.0, 0.5] } ],
            "max_clusters": 2
        }"#;
        let p = GeneratorParams::from_json_str(json).unwrap();
        assert_eq!(p.num_agents(), 2);
        assert_eq!(p.agents[1].ellipse.radius, 0.2);
        assert_eq!(p.obstacles.len(), 1);
        assert_eq!(p.max_clusters, 2);
        assert_eq!(p.solver, SolverBackend::Osqp);
        assert_eq!(p.mpc, MpcParams::default());

        let from_reader = GeneratorParams::from_reader(json.as_bytes()).unwrap();
        assert_eq!(from_reader, p);
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(GeneratorParams::from_json_str("{ not json"), Err(ConfigError::Json(_))));
        assert!(matches!(
            GeneratorParams::from_json_str(r#"{ "agents": [] }"#),
            Err(ConfigError::EmptyFleet)
        ));
        assert!(matches!(
            GeneratorParams::from_file("/nonexistent/dmpc.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
