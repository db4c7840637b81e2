// latent.rs
// Description: Reparameterized latent draw z = mean + eps * exp(0.5 * logvar), eps ~ N(0, I).
//              Noise comes from the sampler's own seeded RNG. A fresh draw is made on every
//              training forward pass, evaluation uses the posterior mean.
// History:
// - 2026-10-13: Add reparameterized latent sampler with seeded noise.
// Author: Marcus Schlieper

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{LatentOdeError, Result};

#[derive(Clone, Debug)]
pub struct LatentSample {
    pub a_z: Array2<f32>,
    // None in evaluation mode.
    pub opt_eps: Option<Array2<f32>>,
}

#[derive(Clone, Debug)]
pub struct LatentSampler {
    rng: StdRng,
}

impl LatentSampler {
    pub fn new(u64_seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(u64_seed),
        }
    }

    pub fn reseed(&mut self, u64_seed: u64) {
        self.rng = StdRng::seed_from_u64(u64_seed);
    }

    pub fn sample(&mut self, a_mean: &Array2<f32>, a_logvar: &Array2<f32>) -> Result<LatentSample> {
        if a_mean.dim() != a_logvar.dim() {
            return Err(LatentOdeError::shape(a_mean.shape(), a_logvar.shape()));
        }
        let rng = &mut self.rng;
        let a_eps = Array2::from_shape_fn(a_mean.raw_dim(), |_| -> f32 { StandardNormal.sample(&mut *rng) });
        let a_z = a_mean + &(&a_eps * &a_logvar.mapv(|lv| (0.5 * lv).exp()));
        Ok(LatentSample {
            a_z,
            opt_eps: Some(a_eps),
        })
    }

    pub fn mean(&self, a_mean: &Array2<f32>) -> LatentSample {
        LatentSample {
            a_z: a_mean.clone(),
            opt_eps: None,
        }
    }

    // (d mean, d logvar) from d z.
    pub fn backward(
        &self,
        sample: &LatentSample,
        a_logvar: &Array2<f32>,
        a_grad_z: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        let a_grad_mean = a_grad_z.clone();
        let a_grad_logvar = match &sample.opt_eps {
            Some(a_eps) => a_grad_z * a_eps * &a_logvar.mapv(|lv| 0.5 * (0.5 * lv).exp()),
            None => Array2::zeros(a_logvar.raw_dim()),
        };
        (a_grad_mean, a_grad_logvar)
    }
}
