// series.rs
// Description: Data contracts between the (external) ingestion step and the model core.
//              SeriesTensor holds values and timestamps shaped [time, series, 1].
//              Batch holds the sampled window shaped [n_sample, batch, 1].
// History:
// - 2026-10-12: Add SeriesTensor and Batch with shape validation.
// - 2026-10-13: Add JSON series file reader for the binary.
// Author: Marcus Schlieper

use std::fs;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{LatentOdeError, Result};

// ----------------------------------------
// SeriesTensor
// ----------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct SeriesTensor {
    a_values: Array3<f32>,
    a_times: Array3<f32>,
}

impl SeriesTensor {
    pub fn new(a_values: Array3<f32>, a_times: Array3<f32>) -> Result<Self> {
        if a_values.shape() != a_times.shape() {
            return Err(LatentOdeError::shape(a_values.shape(), a_times.shape()));
        }
        let (i_t, i_s, i_f) = a_values.dim();
        if i_f != 1 {
            return Err(LatentOdeError::InvalidSeries("feature_dim_must_be_one".to_string()));
        }
        if i_t == 0 || i_s == 0 {
            return Err(LatentOdeError::InvalidSeries("series_empty".to_string()));
        }
        if a_values.iter().chain(a_times.iter()).any(|d| !d.is_finite()) {
            return Err(LatentOdeError::InvalidSeries(
                "non_finite_entry_after_imputation".to_string(),
            ));
        }
        for i_s_idx in 0..i_s {
            for i_t_idx in 1..i_t {
                if a_times[[i_t_idx, i_s_idx, 0]] <= a_times[[i_t_idx - 1, i_s_idx, 0]] {
                    return Err(LatentOdeError::InvalidSeries(format!(
                        "times_not_increasing: series {} at index {}",
                        i_s_idx, i_t_idx
                    )));
                }
            }
        }
        Ok(Self { a_values, a_times })
    }

    // Rows are series (series-major), the layout most upstream tools emit.
    pub fn from_rows(v_values: &[Vec<f32>], opt_times: Option<&[Vec<f32>]>) -> Result<Self> {
        let i_s = v_values.len();
        let i_t = v_values.first().map(|v| v.len()).unwrap_or(0);
        if v_values.iter().any(|v| v.len() != i_t) {
            return Err(LatentOdeError::InvalidSeries("ragged_value_rows".to_string()));
        }

        let mut a_values = Array3::<f32>::zeros((i_t, i_s, 1));
        let mut a_times = Array3::<f32>::zeros((i_t, i_s, 1));
        for (i_s_idx, v_row) in v_values.iter().enumerate() {
            for (i_t_idx, &d) in v_row.iter().enumerate() {
                a_values[[i_t_idx, i_s_idx, 0]] = d;
                a_times[[i_t_idx, i_s_idx, 0]] = i_t_idx as f32;
            }
        }

        if let Some(v_times) = opt_times {
            if v_times.len() != i_s || v_times.iter().any(|v| v.len() != i_t) {
                return Err(LatentOdeError::InvalidSeries("times_shape_mismatch".to_string()));
            }
            for (i_s_idx, v_row) in v_times.iter().enumerate() {
                for (i_t_idx, &d) in v_row.iter().enumerate() {
                    a_times[[i_t_idx, i_s_idx, 0]] = d;
                }
            }
        }

        Self::new(a_values, a_times)
    }

    pub fn from_json_file(p_path: &Path) -> Result<Self> {
        let s_json = fs::read_to_string(p_path).map_err(|e| LatentOdeError::io(p_path, e))?;
        let file: SeriesFile = serde_json::from_str(&s_json)?;
        Self::from_rows(&file.v_values, file.opt_times.as_deref())
    }

    pub fn num_time_points(&self) -> usize {
        self.a_values.dim().0
    }

    pub fn num_series(&self) -> usize {
        self.a_values.dim().1
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.a_values
    }

    pub fn times(&self) -> &Array3<f32> {
        &self.a_times
    }

    pub fn to_record(&self) -> SeriesRecord {
        let (i_t, i_s, _) = self.a_values.dim();
        SeriesRecord {
            i_time_points: i_t,
            i_series: i_s,
            v_values: self.a_values.iter().copied().collect(),
            v_times: self.a_times.iter().copied().collect(),
        }
    }
}

// On-disk layout read by the binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesFile {
    pub v_values: Vec<Vec<f32>>,
    #[serde(default)]
    pub opt_times: Option<Vec<Vec<f32>>>,
}

// Flat copy of the training tensors stored in the terminal checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub i_time_points: usize,
    pub i_series: usize,
    pub v_values: Vec<f32>,
    pub v_times: Vec<f32>,
}

impl SeriesRecord {
    pub fn into_series(self) -> Result<SeriesTensor> {
        let t_shape = (self.i_time_points, self.i_series, 1);
        let a_values = Array3::from_shape_vec(t_shape, self.v_values)
            .map_err(|_| LatentOdeError::CheckpointInvalid("series_values_shape".to_string()))?;
        let a_times = Array3::from_shape_vec(t_shape, self.v_times)
            .map_err(|_| LatentOdeError::CheckpointInvalid("series_times_shape".to_string()))?;
        SeriesTensor::new(a_values, a_times)
    }
}

// ----------------------------------------
// Batch
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct Batch {
    pub v_series_indices: Vec<usize>,
    pub a_values: Array3<f32>,
    pub a_times: Array3<f32>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.a_values.dim().1
    }

    pub fn num_points(&self) -> usize {
        self.a_values.dim().0
    }

    // [N, B] views used by the encoder and decoder.
    pub fn values_2d(&self) -> Array2<f32> {
        self.a_values.index_axis(Axis(2), 0).to_owned()
    }

    pub fn times_2d(&self) -> Array2<f32> {
        self.a_times.index_axis(Axis(2), 0).to_owned()
    }
}
