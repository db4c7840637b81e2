// encoder.rs
// Description: Sequence encoders mapping a batch of (value, time) sequences [N, B] to the
//              posterior parameters mean [B, D] and log variance [B, D].
//
//              gru: a GRU cell reads the sequence in reverse time order. Input per step is the
//                   observed value and the time gap to the previously consumed point.
//              cde: a neural controlled differential equation driven by the piecewise linear
//                   path X = (t - t0, value). dz = G(z) dX on every interval, integrated with
//                   the shared solver.
//
//              Both variants end with a linear head H -> 2D, split into mean and log variance.
//              The variant tag is persisted in checkpoints and validated on load.
// History:
// - 2026-10-13: Add reverse time GRU encoder.
// - 2026-10-14: Add controlled differential equation encoder on the shared solver.
// Author: Marcus Schlieper

use std::fmt;
use std::str::FromStr;

use ndarray::{concatenate, s, Array2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::ModelDims;
use crate::error::{LatentOdeError, Result};
use crate::layer::{GruCell, GruStepCache, Layer, Linear, Mlp, Param};
use crate::solver::{IntervalTape, Solver, VectorField};

// ----------------------------------------
// EncoderKind
// ----------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Gru,
    Cde,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Gru => "gru",
            EncoderKind::Cde => "cde",
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderKind {
    type Err = LatentOdeError;

    fn from_str(s_tag: &str) -> Result<Self> {
        match s_tag {
            "gru" => Ok(EncoderKind::Gru),
            "cde" => Ok(EncoderKind::Cde),
            _ => Err(LatentOdeError::UnknownEncoder(s_tag.to_string())),
        }
    }
}

// ----------------------------------------
// Shared head
// ----------------------------------------

fn split_head(a_out: &Array2<f32>, i_latent: usize) -> (Array2<f32>, Array2<f32>) {
    let a_mean = a_out.slice(s![.., ..i_latent]).to_owned();
    let a_logvar = a_out.slice(s![.., i_latent..]).to_owned();
    (a_mean, a_logvar)
}

fn join_head_grads(a_grad_mean: &Array2<f32>, a_grad_logvar: &Array2<f32>) -> Result<Array2<f32>> {
    concatenate(Axis(1), &[a_grad_mean.view(), a_grad_logvar.view()])
        .map_err(|_| LatentOdeError::shape(a_grad_mean.shape(), a_grad_logvar.shape()))
}

// ----------------------------------------
// GRU encoder
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct GruEncoder {
    cell: GruCell,
    head: Linear,
    i_latent_dim: usize,
}

#[derive(Clone, Debug)]
pub struct GruTape {
    v_caches: Vec<GruStepCache>,
    a_h_final: Array2<f32>,
}

impl GruEncoder {
    pub fn new(dims: &ModelDims, rng: &mut StdRng) -> Self {
        Self {
            cell: GruCell::new(2, dims.i_hidden_dim, rng),
            head: Linear::new(dims.i_hidden_dim, 2 * dims.i_latent_dim, rng),
            i_latent_dim: dims.i_latent_dim,
        }
    }

    fn forward(&self, a_values: &Array2<f32>, a_times: &Array2<f32>) -> (Array2<f32>, GruTape) {
        let (i_n, i_b) = a_values.dim();
        let mut a_h = Array2::<f32>::zeros((i_b, self.cell.hidden_dim()));
        let mut v_caches: Vec<GruStepCache> = Vec::with_capacity(i_n);

        for i_k in (0..i_n).rev() {
            let a_x = Array2::from_shape_fn((i_b, 2), |(b, c)| {
                if c == 0 {
                    a_values[[i_k, b]]
                } else if i_k + 1 < i_n {
                    a_times[[i_k + 1, b]] - a_times[[i_k, b]]
                } else {
                    0.0
                }
            });
            let (a_next, cache) = self.cell.forward(&a_x, &a_h);
            v_caches.push(cache);
            a_h = a_next;
        }

        let a_out = self.head.forward(&a_h);
        (
            a_out,
            GruTape {
                v_caches,
                a_h_final: a_h,
            },
        )
    }

    fn backward(&mut self, tape: &GruTape, a_grad_out: &Array2<f32>) {
        let mut a_grad_h = self.head.backward(&tape.a_h_final, a_grad_out);
        for cache in tape.v_caches.iter().rev() {
            a_grad_h = self.cell.backward(cache, &a_grad_h);
        }
    }
}

// ----------------------------------------
// CDE encoder
// ----------------------------------------

// f(z) = G(z) dX with G: H -> H x 2 and dX the path increment of the interval.
struct CdeField<'a> {
    mlp: &'a mut Mlp,
    a_dx: &'a Array2<f32>,
}

impl VectorField for CdeField<'_> {
    fn eval(&self, a_z: &Array2<f32>) -> Array2<f32> {
        let a_g = self.mlp.forward(a_z);
        let (i_b, i_h) = a_z.dim();
        Array2::from_shape_fn((i_b, i_h), |(b, h)| {
            a_g[[b, 2 * h]] * self.a_dx[[b, 0]] + a_g[[b, 2 * h + 1]] * self.a_dx[[b, 1]]
        })
    }

    fn vjp(&mut self, a_z: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32> {
        let (i_b, i_h) = a_z.dim();
        let a_grad_g = Array2::from_shape_fn((i_b, 2 * i_h), |(b, j)| a_grad[[b, j / 2]] * self.a_dx[[b, j % 2]]);
        self.mlp.backward(a_z, &a_grad_g)
    }
}

#[derive(Clone, Debug)]
pub struct CdeEncoder {
    lin_init: Linear,
    field: Mlp,
    head: Linear,
    i_latent_dim: usize,
}

#[derive(Clone, Debug)]
pub struct CdeTape {
    a_x0: Array2<f32>,
    v_intervals: Vec<(Array2<f32>, IntervalTape)>,
    a_h_final: Array2<f32>,
}

impl CdeEncoder {
    pub fn new(dims: &ModelDims, rng: &mut StdRng) -> Self {
        let i_h = dims.i_hidden_dim;
        Self {
            lin_init: Linear::new(2, i_h, rng),
            field: Mlp::new(i_h, i_h, 2 * i_h, true, rng),
            head: Linear::new(i_h, 2 * dims.i_latent_dim, rng),
            i_latent_dim: dims.i_latent_dim,
        }
    }

    fn path_point(a_values: &Array2<f32>, a_times: &Array2<f32>, i_k: usize) -> Array2<f32> {
        let i_b = a_values.ncols();
        Array2::from_shape_fn((i_b, 2), |(b, c)| {
            if c == 0 {
                a_times[[i_k, b]] - a_times[[0, b]]
            } else {
                a_values[[i_k, b]]
            }
        })
    }

    fn forward(
        &mut self,
        solver: &Solver,
        a_values: &Array2<f32>,
        a_times: &Array2<f32>,
    ) -> Result<(Array2<f32>, CdeTape)> {
        let i_n = a_values.nrows();
        let a_x0 = Self::path_point(a_values, a_times, 0);
        let mut a_h = self.lin_init.forward(&a_x0);

        let mut a_x_prev = a_x0.clone();
        let mut v_intervals: Vec<(Array2<f32>, IntervalTape)> = Vec::with_capacity(i_n.saturating_sub(1));
        for i_k in 1..i_n {
            let a_x = Self::path_point(a_values, a_times, i_k);
            let a_dx = &a_x - &a_x_prev;
            let field = CdeField {
                mlp: &mut self.field,
                a_dx: &a_dx,
            };
            let (a_next, tape) = solver.integrate(&field, &a_h, i_k - 1)?;
            v_intervals.push((a_dx, tape));
            a_h = a_next;
            a_x_prev = a_x;
        }

        let a_out = self.head.forward(&a_h);
        Ok((
            a_out,
            CdeTape {
                a_x0,
                v_intervals,
                a_h_final: a_h,
            },
        ))
    }

    fn backward(&mut self, solver: &Solver, tape: &CdeTape, a_grad_out: &Array2<f32>) {
        let mut a_grad_h = self.head.backward(&tape.a_h_final, a_grad_out);
        for (a_dx, interval) in tape.v_intervals.iter().rev() {
            let mut field = CdeField {
                mlp: &mut self.field,
                a_dx,
            };
            a_grad_h = solver.backward(&mut field, interval, &a_grad_h);
        }
        self.lin_init.backward(&tape.a_x0, &a_grad_h);
    }
}

// ----------------------------------------
// Encoder
// ----------------------------------------

#[derive(Clone, Debug)]
pub enum Encoder {
    Gru(GruEncoder),
    Cde(CdeEncoder),
}

#[derive(Clone, Debug)]
pub enum EncoderTape {
    Gru(GruTape),
    Cde(CdeTape),
}

#[derive(Clone, Debug)]
pub struct Posterior {
    pub a_mean: Array2<f32>,
    pub a_logvar: Array2<f32>,
}

impl Encoder {
    pub fn new(kind: EncoderKind, dims: &ModelDims, rng: &mut StdRng) -> Self {
        match kind {
            EncoderKind::Gru => Encoder::Gru(GruEncoder::new(dims, rng)),
            EncoderKind::Cde => Encoder::Cde(CdeEncoder::new(dims, rng)),
        }
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Encoder::Gru(_) => EncoderKind::Gru,
            Encoder::Cde(_) => EncoderKind::Cde,
        }
    }

    fn latent_dim(&self) -> usize {
        match self {
            Encoder::Gru(e) => e.i_latent_dim,
            Encoder::Cde(e) => e.i_latent_dim,
        }
    }

    // a_values, a_times: [N, B]
    pub fn forward(
        &mut self,
        solver: &Solver,
        a_values: &Array2<f32>,
        a_times: &Array2<f32>,
    ) -> Result<(Posterior, EncoderTape)> {
        if a_values.dim() != a_times.dim() {
            return Err(LatentOdeError::shape(a_values.shape(), a_times.shape()));
        }
        if a_values.is_empty() {
            return Err(LatentOdeError::InvalidSeries("empty_encoder_input".to_string()));
        }

        let i_latent = self.latent_dim();
        let (a_out, tape) = match self {
            Encoder::Gru(e) => {
                let (a_out, t) = e.forward(a_values, a_times);
                (a_out, EncoderTape::Gru(t))
            }
            Encoder::Cde(e) => {
                let (a_out, t) = e.forward(solver, a_values, a_times)?;
                (a_out, EncoderTape::Cde(t))
            }
        };

        let (a_mean, a_logvar) = split_head(&a_out, i_latent);
        Ok((Posterior { a_mean, a_logvar }, tape))
    }

    pub fn backward(
        &mut self,
        solver: &Solver,
        tape: &EncoderTape,
        a_grad_mean: &Array2<f32>,
        a_grad_logvar: &Array2<f32>,
    ) -> Result<()> {
        let a_grad_out = join_head_grads(a_grad_mean, a_grad_logvar)?;
        match (self, tape) {
            (Encoder::Gru(e), EncoderTape::Gru(t)) => e.backward(t, &a_grad_out),
            (Encoder::Cde(e), EncoderTape::Cde(t)) => e.backward(solver, t, &a_grad_out),
            _ => {
                return Err(LatentOdeError::InvalidConfig(
                    "encoder_tape_variant_mismatch".to_string(),
                ))
            }
        }
        Ok(())
    }
}

impl Layer for Encoder {
    fn layer_type(&self) -> &str {
        match self {
            Encoder::Gru(_) => "GruEncoder",
            Encoder::Cde(_) => "CdeEncoder",
        }
    }

    fn params(&self) -> Vec<&Param> {
        let mut v: Vec<&Param> = Vec::new();
        match self {
            Encoder::Gru(e) => {
                v.extend(e.cell.params());
                v.extend(e.head.params());
            }
            Encoder::Cde(e) => {
                v.extend(e.lin_init.params());
                v.extend(e.field.params());
                v.extend(e.head.params());
            }
        }
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v: Vec<&mut Param> = Vec::new();
        match self {
            Encoder::Gru(e) => {
                v.extend(e.cell.params_mut());
                v.extend(e.head.params_mut());
            }
            Encoder::Cde(e) => {
                v.extend(e.lin_init.params_mut());
                v.extend(e.field.params_mut());
                v.extend(e.head.params_mut());
            }
        }
        v
    }
}
