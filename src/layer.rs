// layer.rs
// Description: Trainable building blocks with hand written backward passes.
//              Param couples a value tensor with its gradient accumulator. Linear, Mlp and
//              GruCell implement the Layer trait, which exposes parameters for the optimizer
//              and flat parameter hooks for checkpoints.
//
//              Forward passes are pure (no cached activations) because the ODE solver
//              evaluates the same vector field many times per batch. Backward passes take the
//              forward input again and recompute what they need.
// History:
// - 2026-02-01: Add Layer trait with checkpoint hooks (get/set flat parameters).
// - 2026-10-12: Split gradient accumulation from the optimizer step (Param, zero_grad).
// - 2026-10-12: Replace transformer layers with Linear, Mlp and GruCell.
// - 2026-10-14: Recompute activations in backward to support repeated vector field calls.
// Author: Marcus Schlieper

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{LatentOdeError, Result};
use crate::math;

// ----------------------------------------
// Param
// ----------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub a_value: Array2<f32>,
    pub a_grad: Array2<f32>,
}

impl Param {
    pub fn zeros(t_shape: (usize, usize)) -> Self {
        Self {
            a_value: Array2::zeros(t_shape),
            a_grad: Array2::zeros(t_shape),
        }
    }

    pub fn normal(t_shape: (usize, usize), d_std: f32, rng: &mut StdRng) -> Self {
        let a_value = Array2::from_shape_fn(t_shape, |_| {
            let d_z: f32 = StandardNormal.sample(&mut *rng);
            d_z * d_std
        });
        Self {
            a_value,
            a_grad: Array2::zeros(t_shape),
        }
    }

    pub fn len(&self) -> usize {
        self.a_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a_value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.a_grad.fill(0.0);
    }
}

// ----------------------------------------
// Layer trait
// ----------------------------------------

pub trait Layer {
    fn layer_type(&self) -> &str;

    // Fixed traversal order, shared by optimizer state and checkpoints.
    fn params(&self) -> Vec<&Param>;
    fn params_mut(&mut self) -> Vec<&mut Param>;

    fn parameters(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }

    // Checkpoint hooks.
    fn get_parameters_flat(&self) -> Vec<f32> {
        let mut v_out: Vec<f32> = Vec::with_capacity(self.parameters());
        for p in self.params() {
            v_out.extend(p.a_value.iter().copied());
        }
        v_out
    }

    // Returns the number of values consumed. The caller validates finiteness and the total
    // count before any layer is touched, so a malformed checkpoint is never half applied.
    fn set_parameters_flat(&mut self, v_params: &[f32]) -> Result<usize> {
        let i_needed = self.parameters();
        if v_params.len() < i_needed {
            return Err(LatentOdeError::CheckpointInvalid(format!(
                "not_enough_params_{}",
                self.layer_type().to_lowercase()
            )));
        }

        let mut i_pos: usize = 0;
        for p in self.params_mut() {
            let i_len = p.len();
            for (d_dst, &d_src) in p.a_value.iter_mut().zip(v_params[i_pos..i_pos + i_len].iter()) {
                *d_dst = d_src;
            }
            i_pos += i_len;
        }
        Ok(i_needed)
    }
}

// ----------------------------------------
// Linear
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct Linear {
    w: Param,
    b: Param,
}

impl Linear {
    pub fn new(i_in: usize, i_out: usize, rng: &mut StdRng) -> Self {
        let d_std = (1.0 / (i_in as f32).max(1.0)).sqrt();
        Self {
            w: Param::normal((i_in, i_out), d_std, rng),
            b: Param::zeros((1, i_out)),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.w.a_value.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.w.a_value.ncols()
    }

    // [B, in] -> [B, out]
    pub fn forward(&self, a_input: &Array2<f32>) -> Array2<f32> {
        a_input.dot(&self.w.a_value) + &self.b.a_value
    }

    // Accumulates parameter gradients, returns the gradient w.r.t. the input.
    pub fn backward(&mut self, a_input: &Array2<f32>, a_grads: &Array2<f32>) -> Array2<f32> {
        self.w.a_grad += &a_input.t().dot(a_grads);
        self.b.a_grad += &a_grads.sum_axis(Axis(0)).insert_axis(Axis(0));
        a_grads.dot(&self.w.a_value.t())
    }
}

impl Layer for Linear {
    fn layer_type(&self) -> &str {
        "Linear"
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.w, &self.b]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
    }
}

// ----------------------------------------
// Mlp (two layers, tanh hidden, optional tanh output)
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct Mlp {
    lin_hidden: Linear,
    lin_out: Linear,
    b_tanh_out: bool,
}

impl Mlp {
    pub fn new(i_in: usize, i_hidden: usize, i_out: usize, b_tanh_out: bool, rng: &mut StdRng) -> Self {
        Self {
            lin_hidden: Linear::new(i_in, i_hidden, rng),
            lin_out: Linear::new(i_hidden, i_out, rng),
            b_tanh_out,
        }
    }

    pub fn output_dim(&self) -> usize {
        self.lin_out.output_dim()
    }

    pub fn forward(&self, a_input: &Array2<f32>) -> Array2<f32> {
        let a_h = math::tanh(&self.lin_hidden.forward(a_input));
        let a_o = self.lin_out.forward(&a_h);
        if self.b_tanh_out {
            math::tanh(&a_o)
        } else {
            a_o
        }
    }

    // Vector-Jacobian product at a_input. Accumulates parameter gradients.
    pub fn backward(&mut self, a_input: &Array2<f32>, a_grads: &Array2<f32>) -> Array2<f32> {
        let a_h = math::tanh(&self.lin_hidden.forward(a_input));
        let a_grad_o = if self.b_tanh_out {
            let a_o = math::tanh(&self.lin_out.forward(&a_h));
            math::tanh_backward(&a_o, a_grads)
        } else {
            a_grads.clone()
        };
        let a_grad_h = self.lin_out.backward(&a_h, &a_grad_o);
        let a_grad_pre = math::tanh_backward(&a_h, &a_grad_h);
        self.lin_hidden.backward(a_input, &a_grad_pre)
    }
}

impl Layer for Mlp {
    fn layer_type(&self) -> &str {
        "Mlp"
    }

    fn params(&self) -> Vec<&Param> {
        let mut v = self.lin_hidden.params();
        v.extend(self.lin_out.params());
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v = self.lin_hidden.params_mut();
        v.extend(self.lin_out.params_mut());
        v
    }
}

// ----------------------------------------
// GruCell
// ----------------------------------------
//
// r  = sigmoid(x W_ir + h W_hr + b_r)
// z  = sigmoid(x W_iz + h W_hz + b_z)
// n  = tanh(x W_in + b_in + r * (h W_hn + b_hn))
// h' = (1 - z) * n + z * h

#[derive(Clone, Debug)]
pub struct GruCell {
    w_ir: Param,
    w_iz: Param,
    w_in: Param,
    w_hr: Param,
    w_hz: Param,
    w_hn: Param,
    b_r: Param,
    b_z: Param,
    b_in: Param,
    b_hn: Param,
}

// Activations of one step, kept for backpropagation through time.
#[derive(Clone, Debug)]
pub struct GruStepCache {
    a_x: Array2<f32>,
    a_h: Array2<f32>,
    a_r: Array2<f32>,
    a_z: Array2<f32>,
    a_n: Array2<f32>,
    a_hn: Array2<f32>,
}

impl GruCell {
    pub fn new(i_input_dim: usize, i_hidden_dim: usize, rng: &mut StdRng) -> Self {
        let d_std = (1.0 / (i_hidden_dim as f32).max(1.0)).sqrt();
        let t_in = (i_input_dim, i_hidden_dim);
        let t_hh = (i_hidden_dim, i_hidden_dim);
        let t_b = (1, i_hidden_dim);
        Self {
            w_ir: Param::normal(t_in, d_std, rng),
            w_iz: Param::normal(t_in, d_std, rng),
            w_in: Param::normal(t_in, d_std, rng),
            w_hr: Param::normal(t_hh, d_std, rng),
            w_hz: Param::normal(t_hh, d_std, rng),
            w_hn: Param::normal(t_hh, d_std, rng),
            b_r: Param::zeros(t_b),
            b_z: Param::zeros(t_b),
            b_in: Param::zeros(t_b),
            b_hn: Param::zeros(t_b),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.w_hr.a_value.nrows()
    }

    pub fn forward(&self, a_x: &Array2<f32>, a_h: &Array2<f32>) -> (Array2<f32>, GruStepCache) {
        let a_r = math::sigmoid(&(a_x.dot(&self.w_ir.a_value) + a_h.dot(&self.w_hr.a_value) + &self.b_r.a_value));
        let a_z = math::sigmoid(&(a_x.dot(&self.w_iz.a_value) + a_h.dot(&self.w_hz.a_value) + &self.b_z.a_value));
        let a_hn = a_h.dot(&self.w_hn.a_value) + &self.b_hn.a_value;
        let a_n = math::tanh(&(a_x.dot(&self.w_in.a_value) + &self.b_in.a_value + &(&a_r * &a_hn)));

        let a_h_new = &a_n + &(&a_z * &(a_h - &a_n));

        let cache = GruStepCache {
            a_x: a_x.clone(),
            a_h: a_h.clone(),
            a_r,
            a_z,
            a_n,
            a_hn,
        };
        (a_h_new, cache)
    }

    // Returns the gradient w.r.t. the previous hidden state.
    pub fn backward(&mut self, cache: &GruStepCache, a_grad_h_new: &Array2<f32>) -> Array2<f32> {
        let a_one_minus_z = cache.a_z.mapv(|z| 1.0 - z);

        let a_grad_n = a_grad_h_new * &a_one_minus_z;
        let a_grad_z = a_grad_h_new * &(&cache.a_h - &cache.a_n);
        let mut a_grad_h = a_grad_h_new * &cache.a_z;

        let a_grad_n_pre = math::tanh_backward(&cache.a_n, &a_grad_n);
        let a_grad_hn = &a_grad_n_pre * &cache.a_r;
        let a_grad_r = &a_grad_n_pre * &cache.a_hn;

        let a_grad_z_pre = &a_grad_z * &(&cache.a_z * &a_one_minus_z);
        let a_grad_r_pre = &a_grad_r * &cache.a_r.mapv(|r| r * (1.0 - r));

        let a_xt = cache.a_x.t();
        let a_ht = cache.a_h.t();

        self.w_ir.a_grad += &a_xt.dot(&a_grad_r_pre);
        self.w_iz.a_grad += &a_xt.dot(&a_grad_z_pre);
        self.w_in.a_grad += &a_xt.dot(&a_grad_n_pre);
        self.w_hr.a_grad += &a_ht.dot(&a_grad_r_pre);
        self.w_hz.a_grad += &a_ht.dot(&a_grad_z_pre);
        self.w_hn.a_grad += &a_ht.dot(&a_grad_hn);
        self.b_r.a_grad += &a_grad_r_pre.sum_axis(Axis(0)).insert_axis(Axis(0));
        self.b_z.a_grad += &a_grad_z_pre.sum_axis(Axis(0)).insert_axis(Axis(0));
        self.b_in.a_grad += &a_grad_n_pre.sum_axis(Axis(0)).insert_axis(Axis(0));
        self.b_hn.a_grad += &a_grad_hn.sum_axis(Axis(0)).insert_axis(Axis(0));

        a_grad_h += &a_grad_r_pre.dot(&self.w_hr.a_value.t());
        a_grad_h += &a_grad_z_pre.dot(&self.w_hz.a_value.t());
        a_grad_h += &a_grad_hn.dot(&self.w_hn.a_value.t());
        a_grad_h
    }
}

impl Layer for GruCell {
    fn layer_type(&self) -> &str {
        "GruCell"
    }

    fn params(&self) -> Vec<&Param> {
        vec![
            &self.w_ir, &self.w_iz, &self.w_in, &self.w_hr, &self.w_hz, &self.w_hn, &self.b_r,
            &self.b_z, &self.b_in, &self.b_hn,
        ]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![
            &mut self.w_ir,
            &mut self.w_iz,
            &mut self.w_in,
            &mut self.w_hr,
            &mut self.w_hz,
            &mut self.w_hn,
            &mut self.b_r,
            &mut self.b_z,
            &mut self.b_in,
            &mut self.b_hn,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    // Central differences on a scalar loss. The closure runs the forward pass and, when asked,
    // the backward pass of the concrete layer.
    fn check_param_grads<L, F>(layer: &mut L, mut loss: F, d_tol: f32)
    where
        L: Layer,
        F: FnMut(&mut L, bool) -> f32,
    {
        layer.zero_grad();
        loss(layer, true);
        let v_analytic: Vec<Vec<f32>> = layer
            .params()
            .iter()
            .map(|p| p.a_grad.iter().copied().collect())
            .collect();

        let d_eps = 1e-2_f32;
        let i_params = layer.params().len();
        for i_p in 0..i_params {
            let i_len = layer.params()[i_p].len();
            for i_e in (0..i_len).step_by(3) {
                let d_orig = layer.params()[i_p].a_value.iter().nth(i_e).copied().unwrap();
                set_elem(layer, i_p, i_e, d_orig + d_eps);
                let d_plus = loss(layer, false);
                set_elem(layer, i_p, i_e, d_orig - d_eps);
                let d_minus = loss(layer, false);
                set_elem(layer, i_p, i_e, d_orig);

                let d_fd = (d_plus - d_minus) / (2.0 * d_eps);
                let d_an = v_analytic[i_p][i_e];
                assert!(
                    (d_fd - d_an).abs() <= d_tol * d_fd.abs().max(1.0),
                    "{} param {} elem {}: fd={} analytic={}",
                    layer.layer_type(),
                    i_p,
                    i_e,
                    d_fd,
                    d_an
                );
            }
        }
    }

    fn set_elem<L: Layer>(layer: &mut L, i_p: usize, i_e: usize, d_value: f32) {
        let mut v_params = layer.params_mut();
        if let Some(d) = v_params[i_p].a_value.iter_mut().nth(i_e) {
            *d = d_value;
        }
    }

    #[test]
    fn linear_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut lin = Linear::new(3, 2, &mut rng);
        let a_x = Array2::from_shape_fn((4, 3), |(i, j)| 0.1 * (i as f32) - 0.2 * (j as f32));
        let a_w = Array2::from_shape_fn((4, 2), |(i, j)| 0.3 + 0.1 * (i + j) as f32);

        check_param_grads(
            &mut lin,
            |lin, b_backward| {
                let d = (lin.forward(&a_x) * &a_w).sum();
                if b_backward {
                    lin.backward(&a_x, &a_w);
                }
                d
            },
            1e-2,
        );
    }

    #[test]
    fn mlp_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut mlp = Mlp::new(3, 5, 4, true, &mut rng);
        let a_x = Array2::from_shape_fn((2, 3), |(i, j)| 0.2 * (i as f32) - 0.15 * (j as f32) + 0.05);
        let a_w = Array2::from_shape_fn((2, 4), |(i, j)| 0.5 - 0.2 * (i * j) as f32);

        check_param_grads(
            &mut mlp,
            |mlp, b_backward| {
                let d = (mlp.forward(&a_x) * &a_w).sum();
                if b_backward {
                    mlp.backward(&a_x, &a_w);
                }
                d
            },
            2e-2,
        );
    }

    #[test]
    fn gru_bptt_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cell = GruCell::new(2, 3, &mut rng);
        let v_x: Vec<Array2<f32>> = (0..3)
            .map(|k| Array2::from_shape_fn((2, 2), |(i, j)| 0.3 * k as f32 - 0.2 * i as f32 + 0.1 * j as f32))
            .collect();
        let a_w = Array2::from_shape_fn((2, 3), |(i, j)| 0.4 - 0.3 * i as f32 + 0.2 * j as f32);

        check_param_grads(
            &mut cell,
            |cell, b_backward| {
                let mut a_h = Array2::<f32>::zeros((2, 3));
                let mut v_cache = Vec::new();
                for a_x in v_x.iter() {
                    let (a_next, cache) = cell.forward(a_x, &a_h);
                    v_cache.push(cache);
                    a_h = a_next;
                }
                let d = (&a_h * &a_w).sum();
                if b_backward {
                    let mut a_g = a_w.clone();
                    for cache in v_cache.iter().rev() {
                        a_g = cell.backward(cache, &a_g);
                    }
                }
                d
            },
            2e-2,
        );
    }

    #[test]
    fn flat_parameters_round_trip_through_layer_hooks() {
        let mut rng = StdRng::seed_from_u64(4);
        let src = GruCell::new(2, 4, &mut rng);
        let mut dst = GruCell::new(2, 4, &mut rng);
        let v_flat = src.get_parameters_flat();
        assert_eq!(dst.set_parameters_flat(&v_flat).unwrap(), src.parameters());
        assert_eq!(dst.get_parameters_flat(), v_flat);
        assert!(dst.set_parameters_flat(&v_flat[..3]).is_err());
    }
}
