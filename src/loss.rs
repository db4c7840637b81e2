// loss.rs
// Description: Reconstruction and regularization losses.
//              MAE is the default training objective, the symmetric percentage error is a
//              monitoring metric only, the VAE objective adds a weighted KL term.
// History:
// - 2026-10-13: Add MAE with gradient and symmetric percentage error.
// - 2026-10-14: Add Objective trait with MAE and VAE strategies.
// Author: Marcus Schlieper

use ndarray::Array2;

use crate::config::ObjectiveKind;
use crate::error::{LatentOdeError, Result};

fn check_same_shape(a_truth: &Array2<f32>, a_pred: &Array2<f32>) -> Result<()> {
    if a_truth.dim() != a_pred.dim() {
        return Err(LatentOdeError::shape(a_truth.shape(), a_pred.shape()));
    }
    Ok(())
}

// mean |truth - pred|
pub fn mae(a_truth: &Array2<f32>, a_pred: &Array2<f32>) -> Result<f32> {
    check_same_shape(a_truth, a_pred)?;
    if a_truth.is_empty() {
        return Ok(0.0);
    }
    let d_sum: f32 = ndarray::Zip::from(a_truth)
        .and(a_pred)
        .fold(0.0, |acc, &t, &p| acc + (t - p).abs());
    Ok(d_sum / a_truth.len() as f32)
}

// d mae / d pred = -sign(truth - pred) / count, 0 at ties.
pub fn mae_grad(a_truth: &Array2<f32>, a_pred: &Array2<f32>) -> Result<Array2<f32>> {
    check_same_shape(a_truth, a_pred)?;
    let d_n = a_truth.len().max(1) as f32;
    Ok(ndarray::Zip::from(a_truth).and(a_pred).map_collect(|&t, &p| {
        let d_diff = t - p;
        if d_diff > 0.0 {
            -1.0 / d_n
        } else if d_diff < 0.0 {
            1.0 / d_n
        } else {
            0.0
        }
    }))
}

// 100 * mean(|t - p| / (|t| + |p|)), 0 for an element when both are 0. Range [0, 100].
pub fn smape(a_truth: &Array2<f32>, a_pred: &Array2<f32>) -> Result<f32> {
    check_same_shape(a_truth, a_pred)?;
    if a_truth.is_empty() {
        return Ok(0.0);
    }
    let d_sum: f32 = ndarray::Zip::from(a_truth).and(a_pred).fold(0.0, |acc, &t, &p| {
        let d_den = t.abs() + p.abs();
        if d_den == 0.0 {
            acc
        } else {
            acc + (t - p).abs() / d_den
        }
    });
    Ok(100.0 * d_sum / a_truth.len() as f32)
}

// Batch mean of -0.5 * sum_d (1 + logvar - mean^2 - exp(logvar)).
pub fn kl_divergence(a_mean: &Array2<f32>, a_logvar: &Array2<f32>) -> Result<f32> {
    check_same_shape(a_mean, a_logvar)?;
    let i_b = a_mean.nrows();
    if i_b == 0 {
        return Ok(0.0);
    }
    let d_sum: f32 = ndarray::Zip::from(a_mean)
        .and(a_logvar)
        .fold(0.0, |acc, &m, &lv| acc - 0.5 * (1.0 + lv - m * m - lv.exp()));
    Ok(d_sum / i_b as f32)
}

// ----------------------------------------
// Objective
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct ObjectiveValue {
    pub d_loss: f32,
    pub d_recon: f32,
    pub d_kl: f32,
    pub a_grad_pred: Array2<f32>,
    // None when the objective does not touch the posterior directly.
    pub opt_grad_mean: Option<Array2<f32>>,
    pub opt_grad_logvar: Option<Array2<f32>>,
}

pub trait Objective {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        a_truth: &Array2<f32>,
        a_pred: &Array2<f32>,
        a_mean: &Array2<f32>,
        a_logvar: &Array2<f32>,
    ) -> Result<ObjectiveValue>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MaeObjective;

impl Objective for MaeObjective {
    fn name(&self) -> &str {
        "mae"
    }

    fn evaluate(
        &self,
        a_truth: &Array2<f32>,
        a_pred: &Array2<f32>,
        _a_mean: &Array2<f32>,
        _a_logvar: &Array2<f32>,
    ) -> Result<ObjectiveValue> {
        let d_recon = mae(a_truth, a_pred)?;
        Ok(ObjectiveValue {
            d_loss: d_recon,
            d_recon,
            d_kl: 0.0,
            a_grad_pred: mae_grad(a_truth, a_pred)?,
            opt_grad_mean: None,
            opt_grad_logvar: None,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VaeObjective {
    pub d_kl_weight: f32,
}

impl Objective for VaeObjective {
    fn name(&self) -> &str {
        "vae"
    }

    fn evaluate(
        &self,
        a_truth: &Array2<f32>,
        a_pred: &Array2<f32>,
        a_mean: &Array2<f32>,
        a_logvar: &Array2<f32>,
    ) -> Result<ObjectiveValue> {
        let d_recon = mae(a_truth, a_pred)?;
        let d_kl = kl_divergence(a_mean, a_logvar)?;
        let d_scale = self.d_kl_weight / a_mean.nrows().max(1) as f32;

        Ok(ObjectiveValue {
            d_loss: d_recon + self.d_kl_weight * d_kl,
            d_recon,
            d_kl,
            a_grad_pred: mae_grad(a_truth, a_pred)?,
            opt_grad_mean: Some(a_mean * d_scale),
            opt_grad_logvar: Some(a_logvar.mapv(|lv| d_scale * 0.5 * (lv.exp() - 1.0))),
        })
    }
}

pub fn objective_for(kind: ObjectiveKind) -> Box<dyn Objective> {
    match kind {
        ObjectiveKind::Mae => Box::new(MaeObjective),
        ObjectiveKind::Vae { d_kl_weight } => Box::new(VaeObjective { d_kl_weight }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn smape_is_zero_on_exact_match_including_zeros() {
        let a_t = array![[0.0_f32, 3.0], [0.0, 7.0]];
        assert_eq!(smape(&a_t, &a_t.clone()).unwrap(), 0.0);
    }

    #[test]
    fn smape_stays_in_range() {
        let a_t = array![[0.0_f32, 5.0, 2.0, 1e6], [3.0, 0.0, 4.0, 0.5]];
        let a_p = array![[9.0_f32, 0.0, 2.0, 0.0], [3.5, 0.0, 100.0, 1e-3]];
        let d = smape(&a_t, &a_p).unwrap();
        assert!((0.0..=100.0).contains(&d));

        // Disjoint support everywhere is the upper bound.
        let a_t = array![[1.0_f32, 0.0]];
        let a_p = array![[0.0_f32, 2.0]];
        assert_abs_diff_eq!(smape(&a_t, &a_p).unwrap(), 100.0, epsilon = 1e-4);
    }

    #[test]
    fn mae_and_gradient() {
        let a_t = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let a_p = array![[2.0_f32, 2.0], [1.0, 5.0]];
        assert_abs_diff_eq!(mae(&a_t, &a_p).unwrap(), 1.0, epsilon = 1e-6);
        let a_g = mae_grad(&a_t, &a_p).unwrap();
        assert_eq!(a_g, array![[0.25_f32, 0.0], [-0.25, 0.25]]);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let a_t = Array2::<f32>::zeros((2, 3));
        let a_p = Array2::<f32>::zeros((3, 2));
        assert!(matches!(mae(&a_t, &a_p), Err(LatentOdeError::ShapeMismatch { .. })));
        assert!(smape(&a_t, &a_p).is_err());
    }

    #[test]
    fn kl_vanishes_at_the_prior() {
        let a_m = Array2::<f32>::zeros((4, 6));
        let a_lv = Array2::<f32>::zeros((4, 6));
        assert_abs_diff_eq!(kl_divergence(&a_m, &a_lv).unwrap(), 0.0, epsilon = 1e-7);

        let obj = VaeObjective { d_kl_weight: 0.5 };
        let a_t = array![[1.0_f32]];
        let v = obj.evaluate(&a_t, &a_t, &array![[2.0_f32]], &array![[0.0_f32]]).unwrap();
        // KL of N(2, 1) against N(0, 1) is 2.
        assert_abs_diff_eq!(v.d_kl, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(v.d_loss, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(v.opt_grad_mean.unwrap()[[0, 0]], 1.0, epsilon = 1e-6);
    }
    #[test]
    fn vae_posterior_gradients_match_finite_differences() {
        let obj = VaeObjective { d_kl_weight: 0.3 };
        let a_t = array![[1.0_f32, 4.0], [2.0, 0.0]];
        let a_p = array![[2.0_f32, 3.0], [2.0, 1.0]];
        let a_mean = array![[0.4_f32, -1.1, 0.0], [2.0, 0.3, -0.7]];
        let a_logvar = array![[-0.5_f32, 0.8, 0.0], [1.2, -2.0, 0.3]];

        let v = obj.evaluate(&a_t, &a_p, &a_mean, &a_logvar).unwrap();
        let a_gm = v.opt_grad_mean.unwrap();
        let a_glv = v.opt_grad_logvar.unwrap();

        let d_eps = 1e-2_f32;
        let loss = |a_m: &Array2<f32>, a_lv: &Array2<f32>| obj.evaluate(&a_t, &a_p, a_m, a_lv).unwrap().d_loss;
        for b in 0..2 {
            for d in 0..3 {
                let (mut a_mp, mut a_mm) = (a_mean.clone(), a_mean.clone());
                a_mp[[b, d]] += d_eps;
                a_mm[[b, d]] -= d_eps;
                let d_fd = (loss(&a_mp, &a_logvar) - loss(&a_mm, &a_logvar)) / (2.0 * d_eps);
                assert_abs_diff_eq!(a_gm[[b, d]], d_fd, epsilon = 2e-3);

                let (mut a_lp, mut a_lm) = (a_logvar.clone(), a_logvar.clone());
                a_lp[[b, d]] += d_eps;
                a_lm[[b, d]] -= d_eps;
                let d_fd = (loss(&a_mean, &a_lp) - loss(&a_mean, &a_lm)) / (2.0 * d_eps);
                assert_abs_diff_eq!(a_glv[[b, d]], d_fd, epsilon = 2e-3);
            }
        }
    }
}
