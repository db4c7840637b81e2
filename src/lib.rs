// lib.rs
// Description: Latent ODE variational model for irregularly observed scalar time series and the
//              resumable training loop around it.
//
//              series -> sampler -> encoder -> latent -> decoder (solver) -> loss -> optimizer
//              train and session drive epochs, checkpoints, resume and interrupts.
// History:
// - 2026-02-01: Consolidate project modules.
// - 2026-10-16: Expose library modules for the latent ODE trainer.
// Author: Marcus Schlieper

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod latent;
pub mod layer;
pub mod loss;
pub mod math;
pub mod model;
pub mod optimizer;
pub mod report;
pub mod sampler;
pub mod series;
pub mod session;
pub mod solver;
pub mod train;
pub mod utils;

pub use crate::config::{ModelDims, ObjectiveKind, TrainConfig};
pub use crate::encoder::EncoderKind;
pub use crate::error::{LatentOdeError, Result, SolverError};
pub use crate::model::{ForwardMode, OdeVae};
pub use crate::series::{Batch, SeriesTensor};
pub use crate::session::{Session, SessionOutcome};
pub use crate::train::{TrainOutcome, TrainPhase, Trainer};
