// error.rs
// Description: Error type shared by the model, solver, trainer and checkpoint code.
//              Messages keep the snake_case error code style used across the project.
// History:
// - 2026-10-12: Replace String error codes with a typed error enum.
// - 2026-10-14: Add nested solver errors so divergence surfaces as a hard failure.
// Author: Marcus Schlieper

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LatentOdeError>;

#[derive(Debug, Error)]
pub enum LatentOdeError {
    #[error("invalid_config: {0}")]
    InvalidConfig(String),

    #[error("invalid_series: {0}")]
    InvalidSeries(String),

    #[error("shape_mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("solver_failure: {0}")]
    Solver(#[from] SolverError),

    #[error("non_finite: {0}")]
    NonFinite(String),

    #[error("unknown_encoder: {0}")]
    UnknownEncoder(String),

    #[error("checkpoint_invalid: {0}")]
    CheckpointInvalid(String),

    #[error("optimizer_state_mismatch: {0}")]
    OptimizerState(String),

    #[error("signal_handler: {0}")]
    SignalHandler(String),

    #[error("io_error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json_error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LatentOdeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn shape(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

// Integration failures. Every variant is fatal for the run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolverError {
    #[error("max_steps_exceeded: {i_steps} steps on interval {i_interval}")]
    MaxStepsExceeded { i_interval: usize, i_steps: usize },

    #[error("step_size_underflow: h={d_h:e} on interval {i_interval}")]
    StepSizeUnderflow { i_interval: usize, d_h: f32 },

    #[error("non_finite_state: stage {i_stage} on interval {i_interval}")]
    NonFiniteState { i_interval: usize, i_stage: usize },
}
