// config.rs
// Description: Run configuration consumed by the trainer and the session. All values are passed
//              explicitly into the training loop, nothing is read from global state.
//              Defaults follow the reference training setup (2000 epochs, lr 0.001, batch 1000,
//              100 sampled points, GRU encoder, hidden 64, latent 6).
// History:
// - 2026-10-12: Move hard coded constants into a serde backed TrainConfig.
// - 2026-10-15: Add strict validation for save directories without a model name.
// Author: Marcus Schlieper

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::encoder::EncoderKind;
use crate::error::{LatentOdeError, Result};
use crate::sampler::SubsamplePolicy;
use crate::solver::SolverConfig;

pub const DEFAULT_OUTPUT_DIM: usize = 1;
pub const DEFAULT_HIDDEN_DIM: usize = 64;
pub const DEFAULT_LATENT_DIM: usize = 6;
pub const DEFAULT_MODEL_NAME: &str = "ODE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    // The numeric backend is ndarray on the host, an accelerator request degrades to cpu.
    pub fn resolve(self) -> Device {
        match self {
            Device::Cpu => Device::Cpu,
            Device::Cuda => {
                warn!("accelerator backend not available, falling back to cpu");
                Device::Cpu
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "s_kind", rename_all = "snake_case")]
pub enum ObjectiveKind {
    Mae,
    Vae { d_kl_weight: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    pub i_output_dim: usize,
    pub i_hidden_dim: usize,
    pub i_latent_dim: usize,
}

impl Default for ModelDims {
    fn default() -> Self {
        Self {
            i_output_dim: DEFAULT_OUTPUT_DIM,
            i_hidden_dim: DEFAULT_HIDDEN_DIM,
            i_latent_dim: DEFAULT_LATENT_DIM,
        }
    }
}

impl ModelDims {
    pub fn validate(&self) -> Result<()> {
        if self.i_output_dim != 1 {
            return Err(LatentOdeError::InvalidConfig(
                "output_dim_must_be_one".to_string(),
            ));
        }
        if self.i_hidden_dim == 0 || self.i_latent_dim == 0 {
            return Err(LatentOdeError::InvalidConfig("model_dims_zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub i_epochs: usize,
    pub d_learning_rate: f32,
    pub i_batch_size: usize,
    pub i_n_sample: usize,
    pub encoder: EncoderKind,
    pub device: Device,

    pub opt_model_save_dir: Option<PathBuf>,
    pub opt_training_save_dir: Option<PathBuf>,
    pub s_model_name: String,

    pub opt_snapshot_dir: Option<PathBuf>,
    pub i_snapshot_every: usize,

    pub dims: ModelDims,
    pub objective: ObjectiveKind,
    pub subsample: SubsamplePolicy,
    pub solver: SolverConfig,

    pub u64_seed: u64,
    pub d_weight_decay: f32,
    pub d_grad_clip_norm: f32,
    /// Strict by default: a save directory without a model name fails validation.
    /// With `false` the run logs a warning and trains without any checkpoints, which
    /// is the permissive behaviour of the reference training script.
    pub b_strict_checkpoint_config: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            i_epochs: 2000,
            d_learning_rate: 0.001,
            i_batch_size: 1000,
            i_n_sample: 100,
            encoder: EncoderKind::Gru,
            device: Device::Cpu,
            opt_model_save_dir: None,
            opt_training_save_dir: None,
            s_model_name: DEFAULT_MODEL_NAME.to_string(),
            opt_snapshot_dir: None,
            i_snapshot_every: 20,
            dims: ModelDims::default(),
            objective: ObjectiveKind::Mae,
            subsample: SubsamplePolicy::Contiguous,
            solver: SolverConfig::default(),
            u64_seed: 20_260_101,
            d_weight_decay: 0.0,
            d_grad_clip_norm: 0.0,
            b_strict_checkpoint_config: true,
        }
    }
}

// Resolved checkpoint locations. Empty when checkpointing is disabled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointPlan {
    pub opt_model_save_dir: Option<PathBuf>,
    pub opt_training_save_dir: Option<PathBuf>,
    pub s_model_name: String,
}

impl CheckpointPlan {
    pub fn is_enabled(&self) -> bool {
        !self.s_model_name.is_empty()
            && (self.opt_model_save_dir.is_some() || self.opt_training_save_dir.is_some())
    }
}

impl TrainConfig {
    pub fn from_json_file(p_path: &Path) -> Result<Self> {
        let s_json = fs::read_to_string(p_path).map_err(|e| LatentOdeError::io(p_path, e))?;
        if s_json.trim().is_empty() {
            return Err(LatentOdeError::InvalidConfig("config_json_empty".to_string()));
        }
        let cfg: TrainConfig = serde_json::from_str(&s_json)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.i_epochs == 0 {
            return Err(LatentOdeError::InvalidConfig("epochs_zero".to_string()));
        }
        if !self.d_learning_rate.is_finite() || self.d_learning_rate <= 0.0 {
            return Err(LatentOdeError::InvalidConfig(
                "learning_rate_invalid".to_string(),
            ));
        }
        if self.i_batch_size == 0 {
            return Err(LatentOdeError::InvalidConfig("batch_size_zero".to_string()));
        }
        if self.i_n_sample == 0 {
            return Err(LatentOdeError::InvalidConfig("n_sample_zero".to_string()));
        }
        if !self.d_weight_decay.is_finite() || self.d_weight_decay < 0.0 {
            return Err(LatentOdeError::InvalidConfig(
                "weight_decay_invalid".to_string(),
            ));
        }
        if !self.d_grad_clip_norm.is_finite() || self.d_grad_clip_norm < 0.0 {
            return Err(LatentOdeError::InvalidConfig(
                "grad_clip_norm_invalid".to_string(),
            ));
        }
        if let ObjectiveKind::Vae { d_kl_weight } = self.objective {
            if !d_kl_weight.is_finite() || d_kl_weight < 0.0 {
                return Err(LatentOdeError::InvalidConfig("kl_weight_invalid".to_string()));
            }
        }
        self.dims.validate()?;
        self.solver.validate()?;
        Ok(())
    }

    // Save directories need a model name to build file names.
    // Strict mode rejects the combination, lenient mode logs and disables checkpointing.
    pub fn checkpoint_plan(&self) -> Result<CheckpointPlan> {
        let b_any_dir = self.opt_model_save_dir.is_some() || self.opt_training_save_dir.is_some();
        let s_name = self.s_model_name.trim();

        if b_any_dir && s_name.is_empty() {
            if self.b_strict_checkpoint_config {
                return Err(LatentOdeError::InvalidConfig(
                    "save_dir_without_model_name".to_string(),
                ));
            }
            warn!("save directory given without a model name, checkpointing disabled");
            return Ok(CheckpointPlan::default());
        }

        Ok(CheckpointPlan {
            opt_model_save_dir: self.opt_model_save_dir.clone(),
            opt_training_save_dir: self.opt_training_save_dir.clone(),
            s_model_name: s_name.to_string(),
        })
    }
}
