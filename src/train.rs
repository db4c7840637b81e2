// train.rs
// Description: Resumable training loop and evaluation pass.
//
//              Phases: Idle -> EpochRunning -> BatchRunning -> (Checkpointing) -> Done, with
//              Interrupted as the early exit when the shared interrupt flag is set. The flag is
//              checked before every batch, so an interrupted run returns the running epoch
//              index and the losses of the batches completed so far.
//
//              Per batch: forward, objective and monitoring loss, backward, optional global
//              norm clipping, one optimizer step. Periodic checkpoints are written after every
//              epoch with index > 0 when a training save directory is configured.
// History:
// - 2026-02-01: Consolidated training loop.
// - 2026-10-15: Replace token training with latent ODE batches, add phases and interrupts.
// - 2026-10-16: Add observers, periodic checkpoints and evaluation pass.
// Author: Marcus Schlieper

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::checkpoint::{self, CheckpointKind, CheckpointRecord};
use crate::config::{CheckpointPlan, TrainConfig};
use crate::error::{LatentOdeError, Result};
use crate::layer::Layer;
use crate::loss::{self, Objective};
use crate::math;
use crate::model::{ForwardMode, ForwardOutput, OdeVae};
use crate::optimizer::Adam;
use crate::report::{PredictionSnapshot, TrainObserver};
use crate::sampler::BatchSampler;
use crate::series::{Batch, SeriesTensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainPhase {
    Idle,
    EpochRunning,
    BatchRunning,
    Checkpointing,
    Interrupted,
    Done,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrainOutcome {
    Done {
        i_epoch_idx: usize,
        v_history: Vec<Vec<f32>>,
    },
    Interrupted {
        i_epoch_idx: usize,
        v_partial_losses: Vec<f32>,
        v_history: Vec<Vec<f32>>,
    },
}

#[derive(Clone, Debug)]
pub struct BatchReport {
    pub i_batch_size: usize,
    pub d_loss: f32,
    pub d_recon: f32,
    pub d_kl: f32,
    pub d_smape: f32,
    pub d_grad_norm: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvalReport {
    pub v_batch_losses: Vec<f32>,
    pub d_mean: f32,
    pub d_median: f32,
}

pub struct Trainer {
    cfg: TrainConfig,
    plan: CheckpointPlan,
    sampler: BatchSampler,
    objective: Box<dyn Objective>,
    v_observers: Vec<Box<dyn TrainObserver>>,
    interrupt: Arc<AtomicBool>,
    phase: TrainPhase,
    i_epoch_idx: usize,
    v_history: Vec<Vec<f32>>,
}

impl Trainer {
    pub fn new(cfg: TrainConfig, interrupt: Arc<AtomicBool>) -> Result<Self> {
        cfg.validate()?;
        let plan = cfg.checkpoint_plan()?;
        let sampler = BatchSampler::new(cfg.i_batch_size, cfg.i_n_sample, cfg.subsample, cfg.u64_seed)?;
        let objective = loss::objective_for(cfg.objective);
        Ok(Self {
            cfg,
            plan,
            sampler,
            objective,
            v_observers: Vec::new(),
            interrupt,
            phase: TrainPhase::Idle,
            i_epoch_idx: 0,
            v_history: Vec::new(),
        })
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrainObserver>) {
        self.v_observers.push(observer);
    }

    // Continue from a loaded checkpoint. The recorded epoch is run again (inclusive), so its
    // losses are dropped from the history.
    pub fn resume_from(&mut self, i_epoch_idx: usize, mut v_history: Vec<Vec<f32>>) {
        v_history.truncate(i_epoch_idx);
        self.i_epoch_idx = i_epoch_idx;
        self.v_history = v_history;
        self.phase = TrainPhase::Idle;
    }

    pub fn config(&self) -> &TrainConfig {
        &self.cfg
    }

    pub fn plan(&self) -> &CheckpointPlan {
        &self.plan
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    pub fn epoch_idx(&self) -> usize {
        self.i_epoch_idx
    }

    pub fn history(&self) -> &[Vec<f32>] {
        &self.v_history
    }

    pub fn train(&mut self, model: &mut OdeVae, optimizer: &mut Adam, series: &SeriesTensor) -> Result<TrainOutcome> {
        self.sampler.check_series(series)?;
        let i_series = series.num_series();
        let i_num_batches = self.sampler.num_batches(i_series);
        let i_epochs = self.cfg.i_epochs;

        info!(
            i_start_epoch = self.i_epoch_idx,
            i_epochs,
            i_series,
            i_num_batches,
            s_objective = self.objective.name(),
            "training started"
        );

        while self.i_epoch_idx < i_epochs {
            let i_epoch = self.i_epoch_idx;
            self.phase = TrainPhase::EpochRunning;
            let v_perm = self.sampler.epoch_permutation(i_series);
            let mut v_losses: Vec<f32> = Vec::with_capacity(i_num_batches);

            for i_batch in 0..i_num_batches {
                if self.interrupt.load(Ordering::SeqCst) {
                    self.phase = TrainPhase::Interrupted;
                    info!(i_epoch, i_batch, "training interrupted");
                    return Ok(TrainOutcome::Interrupted {
                        i_epoch_idx: i_epoch,
                        v_partial_losses: v_losses,
                        v_history: self.v_history.clone(),
                    });
                }

                self.phase = TrainPhase::BatchRunning;
                let v_indices = self.sampler.batch_indices(&v_perm, i_batch).to_vec();
                let batch = self.sampler.gen_batch(series, &v_indices)?;

                let (report, out) = self.train_batch(model, optimizer, &batch)?;
                v_losses.push(report.d_loss);
                debug!(
                    i_epoch,
                    i_batch,
                    d_recon = report.d_recon,
                    d_kl = report.d_kl,
                    d_smape = report.d_smape,
                    d_grad_norm = report.d_grad_norm,
                    "batch losses"
                );

                for obs in self.v_observers.iter_mut() {
                    obs.on_batch_end(i_epoch, i_batch, report.i_batch_size, report.d_loss);
                }

                if self.cfg.i_snapshot_every > 0 && i_batch % self.cfg.i_snapshot_every == 0 {
                    let snapshot = self.snapshot(i_epoch, i_batch, &batch, &out);
                    for obs in self.v_observers.iter_mut() {
                        obs.on_snapshot(&snapshot)?;
                    }
                }
            }

            info!(
                i_epoch = i_epoch + 1,
                i_epochs,
                d_mean_loss = math::mean_f32(&v_losses),
                d_median_loss = math::median_f32(&v_losses),
                "epoch finished"
            );
            for obs in self.v_observers.iter_mut() {
                obs.on_epoch_end(i_epoch, &v_losses);
            }
            self.v_history.push(v_losses);

            if i_epoch > 0 {
                if let Some(p_dir) = self.plan.opt_training_save_dir.clone() {
                    self.phase = TrainPhase::Checkpointing;
                    self.save_periodic(model, &p_dir, i_epoch)?;
                }
            }

            self.i_epoch_idx = i_epoch + 1;
        }

        self.phase = TrainPhase::Done;
        info!(i_epochs = self.i_epoch_idx, "training finished");
        Ok(TrainOutcome::Done {
            i_epoch_idx: self.i_epoch_idx,
            v_history: self.v_history.clone(),
        })
    }

    // One optimization step on one batch.
    pub fn train_batch(
        &self,
        model: &mut OdeVae,
        optimizer: &mut Adam,
        batch: &Batch,
    ) -> Result<(BatchReport, ForwardOutput)> {
        model.zero_grad();
        let out = model.forward(batch, ForwardMode::Train)?;
        let a_truth = batch.values_2d();

        let value = self.objective.evaluate(
            &a_truth,
            &out.a_recon,
            &out.posterior.a_mean,
            &out.posterior.a_logvar,
        )?;
        if !value.d_loss.is_finite() {
            return Err(LatentOdeError::NonFinite("training_loss".to_string()));
        }
        let d_smape = loss::smape(&a_truth, &out.a_recon)?;

        model.backward(
            &out,
            &value.a_grad_pred,
            value.opt_grad_mean.as_ref(),
            value.opt_grad_logvar.as_ref(),
        )?;

        let d_grad_norm = {
            let mut v_grads = model.grads_mut();
            math::clip_gradients_global_norm(&mut v_grads, self.cfg.d_grad_clip_norm)?
        };
        optimizer.step(&mut model.params_mut())?;

        Ok((
            BatchReport {
                i_batch_size: batch.batch_size(),
                d_loss: value.d_loss,
                d_recon: value.d_recon,
                d_kl: value.d_kl,
                d_smape,
                d_grad_norm,
            },
            out,
        ))
    }

    // Series in index order, posterior mean, monitoring loss only. No parameter update.
    pub fn evaluate(&mut self, model: &mut OdeVae, series: &SeriesTensor) -> Result<EvalReport> {
        self.sampler.check_series(series)?;
        let i_series = series.num_series();
        let v_order: Vec<usize> = (0..i_series).collect();
        let mut v_batch_losses: Vec<f32> = Vec::with_capacity(self.sampler.num_batches(i_series));

        for i_batch in 0..self.sampler.num_batches(i_series) {
            let v_indices = self.sampler.batch_indices(&v_order, i_batch).to_vec();
            let batch = self.sampler.gen_batch(series, &v_indices)?;
            let out = model.forward(&batch, ForwardMode::Eval)?;
            v_batch_losses.push(loss::smape(&batch.values_2d(), &out.a_recon)?);
        }

        let report = EvalReport {
            d_mean: math::mean_f32(&v_batch_losses),
            d_median: math::median_f32(&v_batch_losses),
            v_batch_losses,
        };
        info!(
            i_batches = report.v_batch_losses.len(),
            d_mean_smape = report.d_mean,
            d_median_smape = report.d_median,
            "evaluation finished"
        );
        Ok(report)
    }

    fn save_periodic(&self, model: &OdeVae, p_dir: &Path, i_epoch: usize) -> Result<()> {
        let p_path = checkpoint::periodic_path(p_dir, &self.plan.s_model_name, i_epoch);
        CheckpointRecord::from_model(
            model,
            CheckpointKind::Periodic,
            i_epoch,
            self.cfg.i_epochs,
            &self.v_history,
        )
        .save(&p_path)
    }

    fn snapshot(&self, i_epoch: usize, i_batch: usize, batch: &Batch, out: &ForwardOutput) -> PredictionSnapshot {
        let a_times = batch.times_2d();
        let v_times: Vec<f32> = a_times.column(0).to_vec();
        PredictionSnapshot {
            s_model_name: self.cfg.s_model_name.clone(),
            i_epoch,
            i_batch,
            i_series: batch.v_series_indices.first().copied().unwrap_or(0),
            d_t_start: v_times.first().copied().unwrap_or(0.0),
            d_t_end: v_times.last().copied().unwrap_or(0.0),
            v_times,
            v_truth: batch.values_2d().column(0).to_vec(),
            v_prediction: out.a_recon.column(0).to_vec(),
        }
    }
}
