// report.rs
// Description: Reporting boundary of the training loop. Observers receive batch and epoch
//              events and periodic prediction snapshots of the first series in a batch.
//              Plotting itself lives outside the crate, SnapshotWriter leaves JSON files for it.
// History:
// - 2026-10-15: Add TrainObserver with log and JSON snapshot observers.
// Author: Marcus Schlieper

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::utils;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionSnapshot {
    pub s_model_name: String,
    pub i_epoch: usize,
    pub i_batch: usize,
    pub i_series: usize,
    pub v_times: Vec<f32>,
    pub v_truth: Vec<f32>,
    pub v_prediction: Vec<f32>,
    pub d_t_start: f32,
    pub d_t_end: f32,
}

pub trait TrainObserver {
    fn on_batch_end(&mut self, _i_epoch: usize, _i_batch: usize, _i_batch_size: usize, _d_loss: f32) {}

    fn on_snapshot(&mut self, _snapshot: &PredictionSnapshot) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _i_epoch: usize, _v_losses: &[f32]) {}
}

// Structured log lines for every event.
#[derive(Clone, Debug, Default)]
pub struct LogObserver;

impl TrainObserver for LogObserver {
    fn on_batch_end(&mut self, i_epoch: usize, i_batch: usize, i_batch_size: usize, d_loss: f32) {
        info!(i_epoch, i_batch, i_batch_size, d_loss, "batch done");
    }

    fn on_snapshot(&mut self, snapshot: &PredictionSnapshot) -> Result<()> {
        info!(
            s_model = %snapshot.s_model_name,
            i_epoch = snapshot.i_epoch,
            i_batch = snapshot.i_batch,
            i_series = snapshot.i_series,
            d_t_start = snapshot.d_t_start,
            d_t_end = snapshot.d_t_end,
            "prediction snapshot"
        );
        Ok(())
    }

    fn on_epoch_end(&mut self, i_epoch: usize, v_losses: &[f32]) {
        let d_mean = crate::math::mean_f32(v_losses);
        info!(i_epoch, i_batches = v_losses.len(), d_mean_loss = d_mean, "epoch done");
    }
}

// {dir}/{model}_epoch_{e}_batch_{i}.json
#[derive(Clone, Debug)]
pub struct SnapshotWriter {
    p_dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(p_dir: PathBuf) -> Self {
        Self { p_dir }
    }

    pub fn path_for(&self, snapshot: &PredictionSnapshot) -> PathBuf {
        self.p_dir.join(format!(
            "{}_epoch_{}_batch_{}.json",
            snapshot.s_model_name, snapshot.i_epoch, snapshot.i_batch
        ))
    }
}

impl TrainObserver for SnapshotWriter {
    fn on_snapshot(&mut self, snapshot: &PredictionSnapshot) -> Result<()> {
        utils::write_json_atomic(&self.path_for(snapshot), snapshot)
    }
}
