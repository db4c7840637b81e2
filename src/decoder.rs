// decoder.rs
// Description: Continuous time decoder. The latent sample is the state at the first query time.
//              A learned autonomous vector field (MLP D -> H -> D, tanh hidden) is integrated
//              between consecutive query times and a linear head maps every state to the
//              output dimension.
//
//              Query times may differ per series. Each interval [t_k, t_k+1] is mapped onto
//              s in [0, 1] with dz/ds = dt_b * f(z), so the whole batch steps together.
// History:
// - 2026-10-13: Add ODE decoder with per series time scaling.
// - 2026-10-14: Add backward pass through the solver tapes.
// Author: Marcus Schlieper

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;

use crate::config::ModelDims;
use crate::error::{LatentOdeError, Result};
use crate::layer::{Layer, Linear, Mlp, Param};
use crate::solver::{IntervalTape, Solver, TimeScaled, VectorField};

impl VectorField for Mlp {
    fn eval(&self, a_z: &Array2<f32>) -> Array2<f32> {
        self.forward(a_z)
    }

    fn vjp(&mut self, a_z: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32> {
        self.backward(a_z, a_grad)
    }
}

#[derive(Clone, Debug)]
pub struct OdeDecoder {
    field: Mlp,
    out: Linear,
}

#[derive(Clone, Debug)]
pub struct DecoderTape {
    // Latent state at every query time, [B, D] each.
    v_states: Vec<Array2<f32>>,
    // Interval lengths [B, 1] and solver tapes, one per interval.
    v_intervals: Vec<(Array2<f32>, IntervalTape)>,
}

impl DecoderTape {
    pub fn states(&self) -> &[Array2<f32>] {
        &self.v_states
    }

    pub fn solver_steps(&self) -> usize {
        self.v_intervals.iter().map(|(_, t)| t.accepted_steps()).sum()
    }
}

impl OdeDecoder {
    pub fn new(dims: &ModelDims, rng: &mut StdRng) -> Self {
        Self {
            field: Mlp::new(dims.i_latent_dim, dims.i_hidden_dim, dims.i_latent_dim, false, rng),
            out: Linear::new(dims.i_latent_dim, dims.i_output_dim, rng),
        }
    }

    // a_z0: [B, D], a_times: [N, B]. Returns the raw (not post processed) prediction [N, B].
    pub fn forward(
        &mut self,
        solver: &Solver,
        a_z0: &Array2<f32>,
        a_times: &Array2<f32>,
    ) -> Result<(Array2<f32>, DecoderTape)> {
        let (i_n, i_b) = a_times.dim();
        if a_z0.nrows() != i_b {
            return Err(LatentOdeError::shape(&[i_b, a_z0.ncols()], a_z0.shape()));
        }
        if i_n == 0 {
            return Err(LatentOdeError::InvalidSeries("empty_query_times".to_string()));
        }

        let mut a_pred = Array2::<f32>::zeros((i_n, i_b));
        let mut v_states: Vec<Array2<f32>> = Vec::with_capacity(i_n);
        let mut v_intervals: Vec<(Array2<f32>, IntervalTape)> = Vec::with_capacity(i_n - 1);

        let mut a_z = a_z0.clone();
        for i_k in 0..i_n {
            if i_k > 0 {
                let a_dt = (&a_times.row(i_k) - &a_times.row(i_k - 1)).insert_axis(Axis(1));
                let scaled = TimeScaled {
                    field: &mut self.field,
                    a_dt: &a_dt,
                };
                let (a_next, tape) = solver.integrate(&scaled, &a_z, i_k - 1)?;
                v_intervals.push((a_dt, tape));
                a_z = a_next;
            }
            let a_y = self.out.forward(&a_z);
            a_pred.row_mut(i_k).assign(&a_y.column(0));
            v_states.push(a_z.clone());
        }

        Ok((
            a_pred,
            DecoderTape {
                v_states,
                v_intervals,
            },
        ))
    }

    // a_grad_pred: [N, B]. Returns the gradient w.r.t. the initial latent state.
    pub fn backward(&mut self, solver: &Solver, tape: &DecoderTape, a_grad_pred: &Array2<f32>) -> Array2<f32> {
        let i_n = tape.v_states.len();
        let mut a_grad_z = Array2::<f32>::zeros(tape.v_states[0].raw_dim());

        for i_k in (0..i_n).rev() {
            let a_g_out = a_grad_pred.row(i_k).to_owned().insert_axis(Axis(1));
            a_grad_z += &self.out.backward(&tape.v_states[i_k], &a_g_out);
            if i_k > 0 {
                let (a_dt, interval) = &tape.v_intervals[i_k - 1];
                let mut scaled = TimeScaled {
                    field: &mut self.field,
                    a_dt,
                };
                a_grad_z = solver.backward(&mut scaled, interval, &a_grad_z);
            }
        }
        a_grad_z
    }
}

impl Layer for OdeDecoder {
    fn layer_type(&self) -> &str {
        "OdeDecoder"
    }

    fn params(&self) -> Vec<&Param> {
        let mut v = self.field.params();
        v.extend(self.out.params());
        v
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut v = self.field.params_mut();
        v.extend(self.out.params_mut());
        v
    }
}
