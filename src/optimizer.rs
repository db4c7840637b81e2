// optimizer.rs
// Description: Adam with optional decoupled weight decay (AdamW) over a list of Param tensors.
//              The optimizer does not own the parameters. The model lends them for each step
//              in its fixed traversal order, moments are matched by position and shape.
//              Moment state is serializable so a resumed run continues the same trajectory.
// History:
// - 2026-02-01: Add AdamW with decoupled weight decay and bias correction.
// - 2026-10-12: Move moments from per layer instances to a single optimizer over Param lists.
// - 2026-10-15: Add serializable optimizer state for resumable training.
// Author: Marcus Schlieper

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{LatentOdeError, Result};
use crate::layer::Param;

pub const DEFAULT_BETA1: f32 = 0.9;
pub const DEFAULT_BETA2: f32 = 0.999;
pub const DEFAULT_EPS: f32 = 1e-8;

#[derive(Clone, Debug)]
struct Moments {
    m_m: Array2<f32>,
    m_v: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct Adam {
    d_learning_rate: f32,
    d_beta1: f32,
    d_beta2: f32,
    d_eps: f32,
    d_weight_decay: f32,
    i_t: usize,
    v_moments: Vec<Moments>,
}

impl Adam {
    pub fn new(d_learning_rate: f32, d_weight_decay: f32) -> Result<Self> {
        if !d_learning_rate.is_finite() || d_learning_rate <= 0.0 {
            return Err(LatentOdeError::InvalidConfig("learning_rate_invalid".to_string()));
        }
        let d_wd = if d_weight_decay.is_finite() && d_weight_decay >= 0.0 {
            d_weight_decay
        } else {
            0.0
        };
        Ok(Self {
            d_learning_rate,
            d_beta1: DEFAULT_BETA1,
            d_beta2: DEFAULT_BETA2,
            d_eps: DEFAULT_EPS,
            d_weight_decay: d_wd,
            i_t: 0,
            v_moments: Vec::new(),
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.d_learning_rate
    }

    pub fn steps(&self) -> usize {
        self.i_t
    }

    pub fn reset(&mut self) {
        self.i_t = 0;
        self.v_moments.clear();
    }

    // Adam step over all parameters:
    // - Decoupled weight decay: params = params - lr * wd * params
    // - Moment updates use gradients only.
    // Gradients are left untouched, the caller clears them before the next batch.
    pub fn step(&mut self, v_params: &mut [&mut Param]) -> Result<()> {
        if self.v_moments.is_empty() {
            self.v_moments = v_params
                .iter()
                .map(|p| Moments {
                    m_m: Array2::zeros(p.a_value.raw_dim()),
                    m_v: Array2::zeros(p.a_value.raw_dim()),
                })
                .collect();
        }
        if self.v_moments.len() != v_params.len() {
            return Err(LatentOdeError::OptimizerState(format!(
                "param_count_mismatch: {} != {}",
                self.v_moments.len(),
                v_params.len()
            )));
        }

        self.i_t = self.i_t.saturating_add(1);
        let d_lr = self.d_learning_rate;
        let d_t = self.i_t as f32;
        let d_bc1 = (1.0 - self.d_beta1.powf(d_t)).max(1e-12);
        let d_bc2 = (1.0 - self.d_beta2.powf(d_t)).max(1e-12);

        for (p, mom) in v_params.iter_mut().zip(self.v_moments.iter_mut()) {
            if p.a_value.raw_dim() != mom.m_m.raw_dim() {
                return Err(LatentOdeError::shape(mom.m_m.shape(), p.a_value.shape()));
            }

            if self.d_weight_decay > 0.0 {
                let d_keep = 1.0 - d_lr * self.d_weight_decay;
                p.a_value.mapv_inplace(|x| x * d_keep);
            }

            mom.m_m = &mom.m_m * self.d_beta1 + &p.a_grad * (1.0 - self.d_beta1);
            mom.m_v = &mom.m_v * self.d_beta2 + &p.a_grad.mapv(|x| x * x) * (1.0 - self.d_beta2);

            let d_eps = self.d_eps;
            let a_update = ndarray::Zip::from(&mom.m_m)
                .and(&mom.m_v)
                .map_collect(|&m, &v| (m / d_bc1) / ((v / d_bc2).sqrt() + d_eps));

            p.a_value.scaled_add(-d_lr, &a_update);
        }
        Ok(())
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            i_t: self.i_t,
            v_moments: self
                .v_moments
                .iter()
                .map(|mom| MomentRecord {
                    v_shape: mom.m_m.shape().to_vec(),
                    v_m: mom.m_m.iter().copied().collect(),
                    v_v: mom.m_v.iter().copied().collect(),
                })
                .collect(),
        }
    }

    // Validates the record against the parameter shapes before replacing any state.
    pub fn load_state(&mut self, state: &AdamState, v_shapes: &[(usize, usize)]) -> Result<()> {
        if state.v_moments.is_empty() {
            self.reset();
            self.i_t = state.i_t;
            return Ok(());
        }
        if state.v_moments.len() != v_shapes.len() {
            return Err(LatentOdeError::OptimizerState(format!(
                "moment_count_mismatch: {} != {}",
                state.v_moments.len(),
                v_shapes.len()
            )));
        }

        let mut v_new: Vec<Moments> = Vec::with_capacity(v_shapes.len());
        for (rec, &t_shape) in state.v_moments.iter().zip(v_shapes.iter()) {
            if rec.v_shape != [t_shape.0, t_shape.1] {
                return Err(LatentOdeError::shape(&[t_shape.0, t_shape.1], &rec.v_shape));
            }
            if rec.v_m.iter().chain(rec.v_v.iter()).any(|d| !d.is_finite()) {
                return Err(LatentOdeError::OptimizerState("moment_non_finite".to_string()));
            }
            let m_m = Array2::from_shape_vec(t_shape, rec.v_m.clone())
                .map_err(|_| LatentOdeError::OptimizerState("moment_m_length".to_string()))?;
            let m_v = Array2::from_shape_vec(t_shape, rec.v_v.clone())
                .map_err(|_| LatentOdeError::OptimizerState("moment_v_length".to_string()))?;
            if m_v.iter().any(|&d| d < 0.0) {
                return Err(LatentOdeError::OptimizerState("moment_v_negative".to_string()));
            }
            v_new.push(Moments { m_m, m_v });
        }

        self.i_t = state.i_t;
        self.v_moments = v_new;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentRecord {
    pub v_shape: Vec<usize>,
    pub v_m: Vec<f32>,
    pub v_v: Vec<f32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub i_t: usize,
    pub v_moments: Vec<MomentRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut p = Param::zeros((1, 2));
        p.a_value[[0, 0]] = 1.0;
        p.a_grad[[0, 0]] = 0.5;
        p.a_grad[[0, 1]] = -3.0;

        let mut opt = Adam::new(0.1, 0.0).unwrap();
        opt.step(&mut [&mut p]).unwrap();

        // Bias corrected first step is lr * sign(g).
        assert_abs_diff_eq!(p.a_value[[0, 0]], 0.9, epsilon = 1e-5);
        assert_abs_diff_eq!(p.a_value[[0, 1]], 0.1, epsilon = 1e-5);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut p = Param::zeros((1, 1));
        p.a_value[[0, 0]] = 5.0;
        let mut opt = Adam::new(0.05, 0.0).unwrap();
        for _ in 0..500 {
            p.a_grad[[0, 0]] = 2.0 * (p.a_value[[0, 0]] - 1.0);
            opt.step(&mut [&mut p]).unwrap();
        }
        assert_abs_diff_eq!(p.a_value[[0, 0]], 1.0, epsilon = 0.05);
    }

    #[test]
    fn state_restores_trajectory() {
        let mut p1 = Param::zeros((2, 1));
        p1.a_grad.fill(0.3);
        let mut opt1 = Adam::new(0.01, 0.0).unwrap();
        opt1.step(&mut [&mut p1]).unwrap();

        let mut p2 = p1.clone();
        let mut opt2 = Adam::new(0.01, 0.0).unwrap();
        opt2.load_state(&opt1.state(), &[(2, 1)]).unwrap();

        p1.a_grad.fill(-0.2);
        p2.a_grad.fill(-0.2);
        opt1.step(&mut [&mut p1]).unwrap();
        opt2.step(&mut [&mut p2]).unwrap();
        assert_eq!(p1.a_value, p2.a_value);
    }

    #[test]
    fn load_state_rejects_shape_mismatch() {
        let mut p = Param::zeros((2, 2));
        let mut opt = Adam::new(0.01, 0.0).unwrap();
        opt.step(&mut [&mut p]).unwrap();
        let state = opt.state();

        let mut other = Adam::new(0.01, 0.0).unwrap();
        assert!(other.load_state(&state, &[(3, 2)]).is_err());
        assert_eq!(other.steps(), 0);
    }
}
