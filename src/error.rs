use thiserror::Error;

/// Top-level error type returned by the generator.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Expected {expected} agent states, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Malformed or inconsistent parameters. Fatal at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("Sampling period ts={ts} does not divide step h={h}")]
    SamplingMismatch { h: f64, ts: f64 },

    #[error("Curve duration {curve} does not match horizon length {horizon}")]
    HorizonMismatch { curve: f64, horizon: f64 },

    #[error("{what}: expected {expected} entries, got {got}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Fleet has no agents")]
    EmptyFleet,
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Per-agent solve failure. Recovered locally by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolveError {
    #[error("QP is infeasible")]
    Infeasible,

    #[error("QP solver numerical failure: {0}")]
    NumericalFailure(String),
}
