// checkpoint.rs
// Description: Checkpoint record, file naming and load validation.
//
//              A record holds magic and version, the encoder tag, model dims, solver settings,
//              the flat parameter vector, the epoch index to resume from, the target epoch
//              count and the loss history. Terminal checkpoints additionally carry optimizer
//              moments, the training series and the run configuration.
//
//              Loading validates the whole record before any model or optimizer state is
//              touched. A mismatch is fatal.
//
//              File names:
//              - periodic:  {training_save_dir}/{name}_{epoch_idx + 1}.json
//              - interrupt: {training_save_dir}/{name}_{epoch_idx}_interrupt.json
//              - terminal:  {model_save_dir}/{name}.json
// History:
// - 2026-02-01: Add checkpoint save and load for model parameters.
// - 2026-10-15: Replace LLM checkpoint with latent ODE record, add epoch bookkeeping.
// - 2026-10-16: Add interrupt checkpoints with a distinct file name.
// Author: Marcus Schlieper

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ModelDims, TrainConfig};
use crate::encoder::EncoderKind;
use crate::error::{LatentOdeError, Result};
use crate::layer::Layer;
use crate::model::OdeVae;
use crate::optimizer::{Adam, AdamState};
use crate::series::SeriesRecord;
use crate::solver::SolverConfig;
use crate::utils;

pub const CHECKPOINT_MAGIC: &str = "LATENT_ODE_CHECKPOINT";
pub const CHECKPOINT_VERSION: &str = "1";

const S_INTERRUPT_SUFFIX: &str = "_interrupt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Periodic,
    Interrupt,
    Final,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub s_magic: String,
    pub s_version: String,
    pub kind: CheckpointKind,

    pub s_encoder: String,
    pub dims: ModelDims,
    pub solver: SolverConfig,

    // Epoch the resumed run starts with.
    pub i_epoch_idx: usize,
    pub i_num_epochs: usize,
    // Batch losses of every completed epoch.
    pub v_history: Vec<Vec<f32>>,
    #[serde(default)]
    pub v_partial_losses: Vec<f32>,

    pub v_params: Vec<f32>,

    #[serde(default)]
    pub opt_optimizer: Option<AdamState>,
    #[serde(default)]
    pub opt_series: Option<SeriesRecord>,
    #[serde(default)]
    pub opt_config: Option<TrainConfig>,
}

impl CheckpointRecord {
    pub fn from_model(
        model: &OdeVae,
        kind: CheckpointKind,
        i_epoch_idx: usize,
        i_num_epochs: usize,
        v_history: &[Vec<f32>],
    ) -> Self {
        Self {
            s_magic: CHECKPOINT_MAGIC.to_string(),
            s_version: CHECKPOINT_VERSION.to_string(),
            kind,
            s_encoder: model.encoder_kind().as_str().to_string(),
            dims: *model.dims(),
            solver: model.solver_config().clone(),
            i_epoch_idx,
            i_num_epochs,
            v_history: v_history.to_vec(),
            v_partial_losses: Vec::new(),
            v_params: model.get_parameters_flat(),
            opt_optimizer: None,
            opt_series: None,
            opt_config: None,
        }
    }

    pub fn with_partial_losses(mut self, v_partial: &[f32]) -> Self {
        self.v_partial_losses = v_partial.to_vec();
        self
    }

    pub fn with_optimizer(mut self, optimizer: &Adam) -> Self {
        self.opt_optimizer = Some(optimizer.state());
        self
    }

    pub fn with_series(mut self, series: SeriesRecord) -> Self {
        self.opt_series = Some(series);
        self
    }

    pub fn with_config(mut self, cfg: &TrainConfig) -> Self {
        self.opt_config = Some(cfg.clone());
        self
    }

    // Structural checks that need no model. Returns the recorded encoder variant.
    pub fn validate(&self) -> Result<EncoderKind> {
        if self.s_magic != CHECKPOINT_MAGIC {
            return Err(LatentOdeError::CheckpointInvalid("checkpoint_magic_mismatch".to_string()));
        }
        if self.s_version != CHECKPOINT_VERSION {
            return Err(LatentOdeError::CheckpointInvalid(
                "checkpoint_version_unsupported".to_string(),
            ));
        }
        let kind: EncoderKind = self.s_encoder.parse()?;
        self.dims.validate()?;
        self.solver.validate()?;
        if self.v_params.is_empty() {
            return Err(LatentOdeError::CheckpointInvalid("checkpoint_empty_params".to_string()));
        }
        if self.v_params.iter().any(|d| !d.is_finite()) {
            return Err(LatentOdeError::CheckpointInvalid("checkpoint_param_non_finite".to_string()));
        }
        if self.i_epoch_idx > self.i_num_epochs {
            return Err(LatentOdeError::CheckpointInvalid(format!(
                "checkpoint_epoch_out_of_range: {} > {}",
                self.i_epoch_idx, self.i_num_epochs
            )));
        }
        Ok(kind)
    }

    pub fn save(&self, p_path: &Path) -> Result<()> {
        utils::write_json_atomic(p_path, self)?;
        info!(
            s_path = %p_path.display(),
            kind = ?self.kind,
            i_epoch_idx = self.i_epoch_idx,
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(p_path: &Path) -> Result<Self> {
        let record: CheckpointRecord = utils::read_json_file(p_path)?;
        record.validate()?;
        Ok(record)
    }

    // Rebuilds the model with the recorded encoder variant, dims and solver settings.
    // Nothing is returned unless every check has passed.
    pub fn restore_model(&self, u64_seed: u64) -> Result<OdeVae> {
        let kind = self.validate()?;
        let mut model = OdeVae::new(kind, self.dims, &self.solver, u64_seed)?;
        model.load_parameters_flat(&self.v_params)?;
        Ok(model)
    }

    // Restores optimizer moments when the record carries them.
    pub fn restore_optimizer(&self, optimizer: &mut Adam, model: &OdeVae) -> Result<bool> {
        match &self.opt_optimizer {
            Some(state) => {
                optimizer.load_state(state, &model.param_shapes())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ----------------------------------------
// File names
// ----------------------------------------

pub fn periodic_path(p_dir: &Path, s_name: &str, i_epoch_idx: usize) -> PathBuf {
    p_dir.join(format!("{}_{}.json", s_name, i_epoch_idx + 1))
}

pub fn interrupt_path(p_dir: &Path, s_name: &str, i_epoch_idx: usize) -> PathBuf {
    p_dir.join(format!("{}_{}{}.json", s_name, i_epoch_idx, S_INTERRUPT_SUFFIX))
}

pub fn final_path(p_dir: &Path, s_name: &str) -> PathBuf {
    p_dir.join(format!("{}.json", s_name))
}

// "ODE_51" and "ODE_50_interrupt" name checkpoints of the run "ODE".
pub fn strip_checkpoint_suffix(s_name: &str) -> &str {
    let s_core = s_name.strip_suffix(S_INTERRUPT_SUFFIX).unwrap_or(s_name);
    match s_core.rfind('_') {
        Some(i_pos)
            if i_pos > 0
                && i_pos + 1 < s_core.len()
                && s_core[i_pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &s_core[..i_pos]
        }
        _ => s_name,
    }
}
