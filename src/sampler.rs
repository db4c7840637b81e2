// sampler.rs
// Description: Mini batch sampling. One random permutation of the series indices per epoch is
//              sliced into batches (last batch takes the remainder). Within a batch a fixed
//              number of time points is selected per series, either as a contiguous window or
//              as a sorted random subset.
// History:
// - 2026-10-12: Add epoch permutation and batch slicing.
// - 2026-10-13: Add contiguous and random time point subsampling policies.
// Author: Marcus Schlieper

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{LatentOdeError, Result};
use crate::series::{Batch, SeriesTensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsamplePolicy {
    Contiguous,
    Random,
}

pub struct BatchSampler {
    i_batch_size: usize,
    i_n_sample: usize,
    policy: SubsamplePolicy,
    rng: StdRng,
}

impl BatchSampler {
    pub fn new(
        i_batch_size: usize,
        i_n_sample: usize,
        policy: SubsamplePolicy,
        u64_seed: u64,
    ) -> Result<Self> {
        if i_batch_size == 0 {
            return Err(LatentOdeError::InvalidConfig("batch_size_zero".to_string()));
        }
        if i_n_sample == 0 {
            return Err(LatentOdeError::InvalidConfig("n_sample_zero".to_string()));
        }
        Ok(Self {
            i_batch_size,
            i_n_sample,
            policy,
            rng: StdRng::seed_from_u64(u64_seed),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.i_batch_size
    }

    pub fn n_sample(&self) -> usize {
        self.i_n_sample
    }

    // ceil(S / batch_size)
    pub fn num_batches(&self, i_series: usize) -> usize {
        i_series.div_ceil(self.i_batch_size)
    }

    pub fn check_series(&self, series: &SeriesTensor) -> Result<()> {
        if self.i_n_sample > series.num_time_points() {
            return Err(LatentOdeError::InvalidConfig(format!(
                "n_sample_exceeds_series_length: {} > {}",
                self.i_n_sample,
                series.num_time_points()
            )));
        }
        Ok(())
    }

    // Drawn once per epoch and reused as the partition for every batch of that epoch.
    pub fn epoch_permutation(&mut self, i_series: usize) -> Vec<usize> {
        let mut v_perm: Vec<usize> = (0..i_series).collect();
        v_perm.shuffle(&mut self.rng);
        v_perm
    }

    pub fn batch_indices<'a>(&self, v_perm: &'a [usize], i_batch: usize) -> &'a [usize] {
        let i_start = (i_batch * self.i_batch_size).min(v_perm.len());
        let i_end = ((i_batch + 1) * self.i_batch_size).min(v_perm.len());
        &v_perm[i_start..i_end]
    }

    fn sample_time_indices(&mut self, i_len: usize) -> Vec<usize> {
        let i_n = self.i_n_sample;
        match self.policy {
            SubsamplePolicy::Contiguous => {
                let i_start = self.rng.random_range(0..=(i_len - i_n));
                (i_start..i_start + i_n).collect()
            }
            SubsamplePolicy::Random => {
                let mut v_idx = rand::seq::index::sample(&mut self.rng, i_len, i_n).into_vec();
                v_idx.sort_unstable();
                v_idx
            }
        }
    }

    pub fn gen_batch(&mut self, series: &SeriesTensor, v_indices: &[usize]) -> Result<Batch> {
        self.check_series(series)?;
        if v_indices.is_empty() {
            return Err(LatentOdeError::InvalidConfig("empty_batch".to_string()));
        }

        let i_len = series.num_time_points();
        let i_n = self.i_n_sample;
        let i_b = v_indices.len();

        let mut a_values = Array3::<f32>::zeros((i_n, i_b, 1));
        let mut a_times = Array3::<f32>::zeros((i_n, i_b, 1));

        for (i_col, &i_series_idx) in v_indices.iter().enumerate() {
            if i_series_idx >= series.num_series() {
                return Err(LatentOdeError::InvalidConfig(format!(
                    "series_index_out_of_range: {}",
                    i_series_idx
                )));
            }
            let v_time_idx = self.sample_time_indices(i_len);
            for (i_row, &i_t) in v_time_idx.iter().enumerate() {
                a_values[[i_row, i_col, 0]] = series.values()[[i_t, i_series_idx, 0]];
                a_times[[i_row, i_col, 0]] = series.times()[[i_t, i_series_idx, 0]];
            }
        }

        Ok(Batch {
            v_series_indices: v_indices.to_vec(),
            a_values,
            a_times,
        })
    }
}
