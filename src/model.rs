// model.rs
// Description: OdeVae aggregate: sequence encoder, latent sampler and continuous decoder with a
//              shared solver. The model owns every trainable parameter. The optimizer borrows
//              them during a step, checkpoints read and write them as one flat vector
//              (encoder parameters first, decoder parameters second).
//
//              Reconstructions are rounded half to even and clamped at zero. The backward pass
//              treats that post processing as identity so gradients reach the decoder.
// History:
// - 2026-10-13: Add OdeVae forward pass with post processing.
// - 2026-10-14: Add backward pass and straight through post processing gradient.
// - 2026-10-15: Validate flat parameters completely before assignment.
// Author: Marcus Schlieper

use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::ModelDims;
use crate::decoder::{DecoderTape, OdeDecoder};
use crate::encoder::{Encoder, EncoderKind, EncoderTape, Posterior};
use crate::error::{LatentOdeError, Result};
use crate::latent::{LatentSample, LatentSampler};
use crate::layer::{Layer, Param};
use crate::math;
use crate::series::Batch;
use crate::solver::{Solver, SolverConfig};

// Offset between the initialization stream and the noise stream.
const NOISE_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardMode {
    // Fresh latent noise, tapes kept for backward.
    Train,
    // Posterior mean, no gradient step follows.
    Eval,
}

#[derive(Clone, Debug)]
pub struct ForwardOutput {
    // Post processed reconstruction [N, B].
    pub a_recon: Array2<f32>,
    // Decoder output before rounding [N, B].
    pub a_raw: Array2<f32>,
    pub posterior: Posterior,
    latent: LatentSample,
    encoder_tape: EncoderTape,
    decoder_tape: DecoderTape,
}

impl ForwardOutput {
    pub fn recon_3d(&self) -> Array3<f32> {
        self.a_recon.clone().insert_axis(Axis(2))
    }

    pub fn latent(&self) -> &Array2<f32> {
        &self.latent.a_z
    }
}

#[derive(Clone, Debug)]
pub struct OdeVae {
    dims: ModelDims,
    encoder: Encoder,
    sampler: LatentSampler,
    decoder: OdeDecoder,
    solver: Solver,
}

impl OdeVae {
    pub fn new(kind: EncoderKind, dims: ModelDims, solver_cfg: &SolverConfig, u64_seed: u64) -> Result<Self> {
        dims.validate()?;
        let solver = Solver::new(solver_cfg)?;
        let mut rng = StdRng::seed_from_u64(u64_seed);
        let encoder = Encoder::new(kind, &dims, &mut rng);
        let decoder = OdeDecoder::new(&dims, &mut rng);
        let model = Self {
            dims,
            encoder,
            sampler: LatentSampler::new(u64_seed ^ NOISE_SEED_OFFSET),
            decoder,
            solver,
        };
        debug!(
            s_encoder = kind.as_str(),
            i_params = model.parameters(),
            "model initialized"
        );
        Ok(model)
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn encoder_kind(&self) -> EncoderKind {
        self.encoder.kind()
    }

    pub fn solver_config(&self) -> &SolverConfig {
        self.solver.config()
    }

    pub fn reseed_noise(&mut self, u64_seed: u64) {
        self.sampler.reseed(u64_seed);
    }

    pub fn forward(&mut self, batch: &Batch, mode: ForwardMode) -> Result<ForwardOutput> {
        let a_values = batch.values_2d();
        let a_times = batch.times_2d();

        let (posterior, encoder_tape) = self.encoder.forward(&self.solver, &a_values, &a_times)?;
        let latent = match mode {
            ForwardMode::Train => self.sampler.sample(&posterior.a_mean, &posterior.a_logvar)?,
            ForwardMode::Eval => self.sampler.mean(&posterior.a_mean),
        };
        let (a_raw, decoder_tape) = self.decoder.forward(&self.solver, &latent.a_z, &a_times)?;
        let a_recon = math::round_clamp_non_negative(&a_raw);

        Ok(ForwardOutput {
            a_recon,
            a_raw,
            posterior,
            latent,
            encoder_tape,
            decoder_tape,
        })
    }

    // Accumulates parameter gradients. a_grad_recon is d loss / d recon [N, B]; the optional
    // posterior gradients come from regularizers acting on mean and log variance directly.
    pub fn backward(
        &mut self,
        out: &ForwardOutput,
        a_grad_recon: &Array2<f32>,
        opt_grad_mean: Option<&Array2<f32>>,
        opt_grad_logvar: Option<&Array2<f32>>,
    ) -> Result<()> {
        if a_grad_recon.dim() != out.a_recon.dim() {
            return Err(LatentOdeError::shape(out.a_recon.shape(), a_grad_recon.shape()));
        }

        let a_grad_z = self.decoder.backward(&self.solver, &out.decoder_tape, a_grad_recon);
        let (mut a_grad_mean, mut a_grad_logvar) =
            self.sampler
                .backward(&out.latent, &out.posterior.a_logvar, &a_grad_z);
        if let Some(a_g) = opt_grad_mean {
            a_grad_mean += a_g;
        }
        if let Some(a_g) = opt_grad_logvar {
            a_grad_logvar += a_g;
        }

        self.encoder
            .backward(&self.solver, &out.encoder_tape, &a_grad_mean, &a_grad_logvar)
    }

    pub fn param_shapes(&self) -> Vec<(usize, usize)> {
        self.params().iter().map(|p| p.a_value.dim()).collect()
    }

    pub fn grads_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.params_mut().into_iter().map(|p| &mut p.a_grad).collect()
    }

    // Exact length and finiteness are checked before any value is written.
    pub fn load_parameters_flat(&mut self, v_params: &[f32]) -> Result<()> {
        let i_needed = self.parameters();
        if v_params.len() != i_needed {
            return Err(LatentOdeError::CheckpointInvalid(format!(
                "param_count_mismatch: expected {}, got {}",
                i_needed,
                v_params.len()
            )));
        }
        if v_params.iter().any(|d| !d.is_finite()) {
            return Err(LatentOdeError::CheckpointInvalid("param_non_finite".to_string()));
        }
        self.set_parameters_flat(v_params)?;
        Ok(())
    }
}

impl Layer for OdeVae {
    fn layer_type(&self) -> &str {
        "OdeVae"
    }

    fn params(&self) -> Vec<&Param> {
        let mut v = self.encoder.params();
        v.extend(self.decoder.params());
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v = self.encoder.params_mut();
        v.extend(self.decoder.params_mut());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{BatchSampler, SubsamplePolicy};
    use crate::series::SeriesTensor;
    use crate::solver::SolverMethod;

    fn tiny_dims() -> ModelDims {
        ModelDims {
            i_output_dim: 1,
            i_hidden_dim: 4,
            i_latent_dim: 2,
        }
    }

    fn rk4() -> SolverConfig {
        SolverConfig {
            method: SolverMethod::Rk4,
            i_rk4_substeps: 2,
            ..SolverConfig::default()
        }
    }

    fn batch() -> Batch {
        let v_rows: Vec<Vec<f32>> = (0..3)
            .map(|s| (0..6).map(|t| ((s + t) % 4) as f32 * 2.0).collect())
            .collect();
        let series = SeriesTensor::from_rows(&v_rows, None).unwrap();
        let mut sampler = BatchSampler::new(3, 5, SubsamplePolicy::Contiguous, 2).unwrap();
        sampler.gen_batch(&series, &[0, 1, 2]).unwrap()
    }

    #[test]
    fn reconstruction_is_non_negative_integer() {
        let mut model = OdeVae::new(EncoderKind::Gru, tiny_dims(), &rk4(), 3).unwrap();
        let out = model.forward(&batch(), ForwardMode::Train).unwrap();
        assert_eq!(out.a_recon.dim(), (5, 3));
        assert_eq!(out.recon_3d().dim(), (5, 3, 1));
        for &d in out.a_recon.iter() {
            assert!(d >= 0.0);
            assert_eq!(d, d.round());
        }
    }

    #[test]
    fn fixed_seed_forward_is_deterministic() {
        let b = batch();
        let mut model = OdeVae::new(EncoderKind::Gru, tiny_dims(), &rk4(), 4).unwrap();
        model.reseed_noise(77);
        let o1 = model.forward(&b, ForwardMode::Train).unwrap();
        model.reseed_noise(77);
        let o2 = model.forward(&b, ForwardMode::Train).unwrap();
        assert_eq!(o1.a_raw, o2.a_raw);
        assert_eq!(o1.latent(), o2.latent());

        let mut twin = OdeVae::new(EncoderKind::Gru, tiny_dims(), &rk4(), 4).unwrap();
        twin.reseed_noise(77);
        let o3 = twin.forward(&b, ForwardMode::Train).unwrap();
        assert_eq!(o1.a_raw, o3.a_raw);
    }

    #[test]
    fn eval_mode_uses_posterior_mean() {
        let mut model = OdeVae::new(EncoderKind::Cde, tiny_dims(), &rk4(), 5).unwrap();
        let out = model.forward(&batch(), ForwardMode::Eval).unwrap();
        assert_eq!(out.latent(), &out.posterior.a_mean);
    }

    #[test]
    fn backward_fills_gradients_for_every_tensor() {
        let b = batch();
        for kind in [EncoderKind::Gru, EncoderKind::Cde] {
            let mut model = OdeVae::new(kind, tiny_dims(), &rk4(), 6).unwrap();
            model.zero_grad();
            let out = model.forward(&b, ForwardMode::Train).unwrap();
            let a_g = Array2::from_elem(out.a_recon.raw_dim(), 0.1_f32);
            model.backward(&out, &a_g, None, None).unwrap();
            let d_norm = math::global_norm(&model.params().iter().map(|p| &p.a_grad).collect::<Vec<_>>());
            assert!(d_norm > 0.0 && d_norm.is_finite());
        }
    }

    #[test]
    fn invalid_flat_parameters_leave_model_untouched() {
        let mut model = OdeVae::new(EncoderKind::Gru, tiny_dims(), &rk4(), 7).unwrap();
        let v_before = model.get_parameters_flat();

        let mut v_bad = v_before.clone();
        v_bad.pop();
        assert!(model.load_parameters_flat(&v_bad).is_err());

        let mut v_nan = vec![0.5_f32; v_before.len()];
        v_nan[0] = f32::NAN;
        assert!(model.load_parameters_flat(&v_nan).is_err());
        assert_eq!(model.get_parameters_flat(), v_before);

        let v_new = vec![0.01_f32; v_before.len()];
        model.load_parameters_flat(&v_new).unwrap();
        assert_eq!(model.get_parameters_flat(), v_new);
    }
}
