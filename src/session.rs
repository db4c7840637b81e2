// session.rs
// Description: One training session: resume from the terminal checkpoint when it exists,
//              train until done or interrupted, then persist the result.
//
//              - Resume: {model_save_dir}/{name}.json is loaded when present. The model is
//                rebuilt with the recorded encoder variant and the epoch index and history are
//                restored. A name with a checkpoint suffix (_51, _50_interrupt) is reduced to
//                the base name for every later file.
//              - Interrupt: Ctrl-C sets a shared flag, the trainer stops before the next batch
//                and the session writes {training_save_dir}/{name}_{epoch}_interrupt.json
//                (skipped in epoch 0).
//              - Done: {model_save_dir}/{name}.json with optimizer state, series and config.
// History:
// - 2026-10-16: Add session orchestration with resume, Ctrl-C handling and final save.
// - 2026-10-19: Reject targets below the checkpoint epoch, clear the interrupt flag after a run.
// Author: Marcus Schlieper

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointKind, CheckpointRecord};
use crate::config::TrainConfig;
use crate::error::{LatentOdeError, Result};
use crate::model::OdeVae;
use crate::optimizer::Adam;
use crate::report::{LogObserver, SnapshotWriter};
use crate::series::SeriesTensor;
use crate::train::{EvalReport, TrainOutcome, Trainer};

#[derive(Debug)]
pub struct SessionOutcome {
    pub outcome: TrainOutcome,
    pub opt_saved: Option<PathBuf>,
    pub opt_eval: Option<EvalReport>,
    pub b_resumed: bool,
}

// Model, optimizer and trainer ready to run, possibly restored from a checkpoint.
pub struct Prepared {
    pub model: OdeVae,
    pub optimizer: Adam,
    pub trainer: Trainer,
    pub b_resumed: bool,
}

pub struct Session {
    cfg: TrainConfig,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    pub fn new(cfg: TrainConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    // Ctrl-C sets the flag. The handler is process wide and can be installed once.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let flag = self.interrupt_flag();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| LatentOdeError::SignalHandler(e.to_string()))
    }

    pub fn prepare(&self) -> Result<Prepared> {
        let device = self.cfg.device.resolve();
        let plan = self.cfg.checkpoint_plan()?;
        let mut cfg = self.cfg.clone();

        let opt_final = plan
            .opt_model_save_dir
            .as_ref()
            .map(|p_dir| checkpoint::final_path(p_dir, &plan.s_model_name))
            .filter(|p_path| p_path.exists());

        let (model, optimizer, i_epoch_idx, v_history, b_resumed) = match opt_final {
            Some(p_path) => {
                let record = CheckpointRecord::load(&p_path)?;
                // The target may not lie below the recorded epoch, the record must stay loadable.
                if record.i_epoch_idx > cfg.i_epochs {
                    return Err(LatentOdeError::InvalidConfig(format!(
                        "epochs_below_checkpoint: checkpoint at epoch {}, target {}",
                        record.i_epoch_idx, cfg.i_epochs
                    )));
                }
                let model = record.restore_model(cfg.u64_seed)?;
                if model.encoder_kind() != cfg.encoder {
                    info!(
                        s_requested = cfg.encoder.as_str(),
                        s_recorded = model.encoder_kind().as_str(),
                        "encoder taken from checkpoint"
                    );
                }
                if *model.dims() != cfg.dims {
                    warn!("model dims taken from checkpoint, configured dims ignored");
                }
                let mut optimizer = Adam::new(cfg.d_learning_rate, cfg.d_weight_decay)?;
                let b_opt = record.restore_optimizer(&mut optimizer, &model)?;

                cfg.encoder = model.encoder_kind();
                cfg.dims = *model.dims();
                cfg.solver = model.solver_config().clone();
                cfg.s_model_name = checkpoint::strip_checkpoint_suffix(&plan.s_model_name).to_string();

                info!(
                    s_path = %p_path.display(),
                    i_epoch_idx = record.i_epoch_idx,
                    b_optimizer_restored = b_opt,
                    s_model_name = %cfg.s_model_name,
                    "resuming from checkpoint"
                );
                (model, optimizer, record.i_epoch_idx, record.v_history, true)
            }
            None => {
                let model = OdeVae::new(cfg.encoder, cfg.dims, &cfg.solver, cfg.u64_seed)?;
                let optimizer = Adam::new(cfg.d_learning_rate, cfg.d_weight_decay)?;
                (model, optimizer, 0, Vec::new(), false)
            }
        };

        info!(
            device = ?device,
            s_encoder = model.encoder_kind().as_str(),
            i_epoch_idx,
            i_epochs = cfg.i_epochs,
            "session prepared"
        );

        let opt_snapshot_dir = cfg.opt_snapshot_dir.clone();
        let mut trainer = Trainer::new(cfg, self.interrupt_flag())?;
        trainer.resume_from(i_epoch_idx, v_history);
        trainer.add_observer(Box::new(LogObserver));
        if let Some(p_dir) = opt_snapshot_dir {
            trainer.add_observer(Box::new(SnapshotWriter::new(p_dir)));
        }

        Ok(Prepared {
            model,
            optimizer,
            trainer,
            b_resumed,
        })
    }

    // A raised interrupt flag is consumed by the run it stops, so the session can run again.
    pub fn run(&self, series: &SeriesTensor, opt_eval_series: Option<&SeriesTensor>) -> Result<SessionOutcome> {
        let Prepared {
            mut model,
            mut optimizer,
            mut trainer,
            b_resumed,
        } = self.prepare()?;

        let r_outcome = trainer.train(&mut model, &mut optimizer, series);
        self.interrupt.store(false, Ordering::SeqCst);
        let outcome = r_outcome?;
        let plan = trainer.plan().clone();
        let s_name = trainer.config().s_model_name.clone();

        let opt_saved = match &outcome {
            TrainOutcome::Interrupted {
                i_epoch_idx,
                v_partial_losses,
                v_history,
            } => match &plan.opt_training_save_dir {
                Some(p_dir) if *i_epoch_idx > 0 => {
                    let p_path = checkpoint::interrupt_path(p_dir, &s_name, *i_epoch_idx);
                    CheckpointRecord::from_model(
                        &model,
                        CheckpointKind::Interrupt,
                        *i_epoch_idx,
                        trainer.config().i_epochs,
                        v_history,
                    )
                    .with_partial_losses(v_partial_losses)
                    .save(&p_path)?;
                    Some(p_path)
                }
                Some(_) => {
                    info!("interrupted in the first epoch, no interrupt checkpoint written");
                    None
                }
                None => None,
            },
            TrainOutcome::Done { i_epoch_idx, v_history } => match &plan.opt_model_save_dir {
                Some(p_dir) => {
                    let p_path = checkpoint::final_path(p_dir, &s_name);
                    CheckpointRecord::from_model(
                        &model,
                        CheckpointKind::Final,
                        *i_epoch_idx,
                        trainer.config().i_epochs,
                        v_history,
                    )
                    .with_optimizer(&optimizer)
                    .with_series(series.to_record())
                    .with_config(trainer.config())
                    .save(&p_path)?;
                    Some(p_path)
                }
                None => None,
            },
        };

        let opt_eval = match (&outcome, opt_eval_series) {
            (TrainOutcome::Done { .. }, Some(eval_series)) => Some(trainer.evaluate(&mut model, eval_series)?),
            _ => None,
        };

        Ok(SessionOutcome {
            outcome,
            opt_saved,
            opt_eval,
            b_resumed,
        })
    }
}
