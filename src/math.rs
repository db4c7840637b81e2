// math.rs
// Description: Numerical helpers for activations, output post-processing, gradient norm
//              clipping and loss summaries.
// History:
// - 2026-02-01: Consolidate numeric helpers into math.rs.
// - 2026-02-04: Add robust gradient clipping helpers (global norm).
// - 2026-10-12: Clip across all parameter tensors of a model, reject non-finite gradients
//              instead of sanitizing them.
// - 2026-10-13: Add rounding and clamping for count valued reconstructions.
// Author: Marcus Schlieper

use ndarray::Array2;

use crate::error::{LatentOdeError, Result};

pub fn sigmoid(a_x: &Array2<f32>) -> Array2<f32> {
    a_x.mapv(|x| {
        if x >= 0.0 {
            1.0 / (1.0 + (-x).exp())
        } else {
            let d_e = x.exp();
            d_e / (1.0 + d_e)
        }
    })
}

pub fn tanh(a_x: &Array2<f32>) -> Array2<f32> {
    a_x.mapv(f32::tanh)
}

// d tanh(x) / dx expressed through y = tanh(x).
pub fn tanh_backward(a_y: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32> {
    a_grad * &a_y.mapv(|y| 1.0 - y * y)
}

// Target values are non-negative counts: round half to even, clamp at zero.
pub fn round_clamp_non_negative(a_x: &Array2<f32>) -> Array2<f32> {
    a_x.mapv(|x| {
        let d_r = x.round_ties_even();
        if d_r > 0.0 {
            d_r
        } else {
            0.0
        }
    })
}

pub fn all_finite(a_x: &Array2<f32>) -> bool {
    a_x.iter().all(|d| d.is_finite())
}

pub fn global_norm(v_grads: &[&Array2<f32>]) -> f32 {
    let mut d_norm_sq: f32 = 0.0;
    for a_g in v_grads.iter() {
        for &d in a_g.iter() {
            d_norm_sq += d * d;
        }
    }
    d_norm_sq.sqrt()
}

// Global norm clipping.
// - Computes the L2 norm over all tensors and rescales if norm > d_max_norm.
// - d_max_norm <= 0 disables clipping.
// - Non-finite gradients are an error, they mean the forward pass already diverged.
pub fn clip_gradients_global_norm(v_grads: &mut [&mut Array2<f32>], d_max_norm: f32) -> Result<f32> {
    let d_norm = {
        let v_view: Vec<&Array2<f32>> = v_grads.iter().map(|a| &**a).collect();
        global_norm(&v_view)
    };

    if !d_norm.is_finite() {
        return Err(LatentOdeError::NonFinite("gradient_norm".to_string()));
    }
    if d_max_norm <= 0.0 || !d_max_norm.is_finite() || d_norm <= d_max_norm {
        return Ok(d_norm);
    }

    let d_scale = d_max_norm / d_norm;
    for a_g in v_grads.iter_mut() {
        a_g.mapv_inplace(|x| x * d_scale);
    }
    Ok(d_norm)
}

pub fn mean_f32(v_x: &[f32]) -> f32 {
    if v_x.is_empty() {
        return 0.0;
    }
    v_x.iter().sum::<f32>() / v_x.len() as f32
}

pub fn median_f32(v_x: &[f32]) -> f32 {
    if v_x.is_empty() {
        return 0.0;
    }
    let mut v_sorted = v_x.to_vec();
    v_sorted.sort_by(|a, b| a.total_cmp(b));
    let i_mid = v_sorted.len() / 2;
    if v_sorted.len() % 2 == 0 {
        0.5 * (v_sorted[i_mid - 1] + v_sorted[i_mid])
    } else {
        v_sorted[i_mid]
    }
}
