//! Python bindings (enabled with the `python` feature).
//!
//! Vectors cross the boundary as `[x, y, z]` lists and states/commands as
//! `(position, velocity, acceleration)` tuples.

use crate::config::GeneratorParams;
use crate::generator::Generator;
use crate::structs::{AgentState, Command, EllipseParams};
use nalgebra::Vector3;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

type Triple = ([f64; 3], [f64; 3], [f64; 3]);

fn vec3(v: [f64; 3]) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

fn array(v: &Vector3<f64>) -> [f64; 3] {
    [v.x, v.y, v.z]
}

fn triple(c: &Command) -> Triple {
    (array(&c.position), array(&c.velocity), array(&c.acceleration))
}

fn to_py_err(err: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(err.to_string())
}

#[pyclass(name = "Generator")]
pub struct PyGenerator {
    inner: Generator,
}

#[pymethods]
impl PyGenerator {
    /// Builds a generator from a JSON configuration string.
    #[new]
    fn new(config_json: &str) -> PyResult<Self> {
        let params = GeneratorParams::from_json_str(config_json).map_err(to_py_err)?;
        let inner = Generator::new(params).map_err(to_py_err)?;
        Ok(PyGenerator { inner })
    }

    /// Default timing and tuning, one shared footprint for the whole fleet.
    #[staticmethod]
    #[pyo3(signature = (initial, goals, radius=0.3, height_scaling=1.0))]
    fn from_positions(
        initial: Vec<[f64; 3]>,
        goals: Vec<[f64; 3]>,
        radius: f64,
        height_scaling: f64,
    ) -> PyResult<Self> {
        let initial: Vec<Vector3<f64>> = initial.into_iter().map(vec3).collect();
        let goals: Vec<Vector3<f64>> = goals.into_iter().map(vec3).collect();
        let ellipse = EllipseParams {
            radius,
            height_scaling,
            ..EllipseParams::default()
        };
        let agents = GeneratorParams::fleet(&initial, &goals, &[ellipse]).map_err(to_py_err)?;
        let params = GeneratorParams::new(Default::default(), Default::default(), agents);
        let inner = Generator::new(params).map_err(to_py_err)?;
        Ok(PyGenerator { inner })
    }

    fn next_inputs(&mut self, states: Vec<Triple>) -> PyResult<Vec<Vec<Triple>>> {
        let states: Vec<AgentState> = states
            .into_iter()
            .map(|(p, v, a)| AgentState::new(vec3(p), vec3(v), vec3(a)))
            .collect();
        let commands = self.inner.next_inputs(&states).map_err(to_py_err)?;
        Ok(commands
            .iter()
            .map(|cmds| cmds.iter().map(triple).collect())
            .collect())
    }

    /// `(agent_id, center, semi_axes)` for every agent, then every obstacle.
    fn ellipses(&self) -> Vec<(usize, [f64; 3], [f64; 3])> {
        self.inner
            .ellipses()
            .iter()
            .map(|e| (e.agent_id, array(&e.center), array(&e.semi_axes)))
            .collect()
    }

    fn stats_json(&self) -> PyResult<String> {
        self.inner.stats().to_json().map_err(to_py_err)
    }

    #[getter]
    fn num_agents(&self) -> usize {
        self.inner.num_agents()
    }

    #[getter]
    fn cycle(&self) -> u64 {
        self.inner.cycle()
    }
}

#[pymodule]
fn dmpc_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyGenerator>()?;
    Ok(())
}
