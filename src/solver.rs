// solver.rs
// Description: Explicit Runge-Kutta integration of a batched autonomous vector field over the
//              normalized interval s in [0, 1]. Dopri5 is adaptive (Dormand-Prince 5(4) with
//              error control), Rk4 uses a fixed number of substeps.
//
//              Gradients are discretize-then-optimize: every accepted step is written to a tape
//              (step size and stage inputs) and backward runs the exact reverse of the
//              Runge-Kutta combination through the vector field's vector-Jacobian product.
//
//              Any failure (step budget, step size underflow, non-finite stage) is returned as a
//              SolverError. There is no silent retry.
// History:
// - 2026-10-13: Add generic tableau stepping with Dopri5 and Rk4.
// - 2026-10-14: Add tape based backward pass and hard solver failures.
// Author: Marcus Schlieper

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LatentOdeError, Result, SolverError};
use crate::math;

// ----------------------------------------
// Configuration
// ----------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    Dopri5,
    Rk4,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub method: SolverMethod,
    pub d_rtol: f32,
    pub d_atol: f32,
    // Accepted plus rejected steps per interval.
    pub i_max_steps: usize,
    pub d_min_step: f32,
    pub i_rk4_substeps: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: SolverMethod::Dopri5,
            d_rtol: 1e-3,
            d_atol: 1e-4,
            i_max_steps: 1000,
            d_min_step: 1e-6,
            i_rk4_substeps: 4,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.d_rtol.is_finite() || self.d_rtol <= 0.0 {
            return Err(LatentOdeError::InvalidConfig("solver_rtol_invalid".to_string()));
        }
        if !self.d_atol.is_finite() || self.d_atol <= 0.0 {
            return Err(LatentOdeError::InvalidConfig("solver_atol_invalid".to_string()));
        }
        if self.i_max_steps == 0 {
            return Err(LatentOdeError::InvalidConfig("solver_max_steps_zero".to_string()));
        }
        if !self.d_min_step.is_finite() || self.d_min_step <= 0.0 || self.d_min_step >= 1.0 {
            return Err(LatentOdeError::InvalidConfig("solver_min_step_invalid".to_string()));
        }
        if self.i_rk4_substeps == 0 {
            return Err(LatentOdeError::InvalidConfig("solver_rk4_substeps_zero".to_string()));
        }
        Ok(())
    }
}

// ----------------------------------------
// Vector field
// ----------------------------------------

pub trait VectorField {
    // dz/ds for a batch of states [B, D].
    fn eval(&self, a_z: &Array2<f32>) -> Array2<f32>;

    // g^T (df/dz) at a_z. Accumulates parameter gradients of the field.
    fn vjp(&mut self, a_z: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32>;
}

// dz/ds = dt_b * f(z). Maps an interval of length dt_b (per row) onto s in [0, 1].
pub struct TimeScaled<'a, F: VectorField> {
    pub field: &'a mut F,
    pub a_dt: &'a Array2<f32>,
}

impl<F: VectorField> VectorField for TimeScaled<'_, F> {
    fn eval(&self, a_z: &Array2<f32>) -> Array2<f32> {
        self.field.eval(a_z) * self.a_dt
    }

    fn vjp(&mut self, a_z: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32> {
        let a_scaled = a_grad * self.a_dt;
        self.field.vjp(a_z, &a_scaled)
    }
}

// ----------------------------------------
// Tableau
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct Tableau {
    v_a: Vec<Vec<f32>>,
    v_b: Vec<f32>,
    // b - b_hat, present for embedded pairs.
    opt_e: Option<Vec<f32>>,
    // Stage whose input is needed by backward (b_i != 0 or used by a later stage).
    v_needed: Vec<bool>,
    b_fsal: bool,
}

impl Tableau {
    fn build(v_a: Vec<Vec<f32>>, v_b: Vec<f32>, opt_e: Option<Vec<f32>>, b_fsal: bool) -> Self {
        let i_stages = v_b.len();
        let v_needed = (0..i_stages)
            .map(|i| v_b[i] != 0.0 || (i + 1..i_stages).any(|j| v_a[j].get(i).copied().unwrap_or(0.0) != 0.0))
            .collect();
        Self {
            v_a,
            v_b,
            opt_e,
            v_needed,
            b_fsal,
        }
    }

    pub fn dopri5() -> Self {
        let v_a = vec![
            vec![],
            vec![1.0 / 5.0],
            vec![3.0 / 40.0, 9.0 / 40.0],
            vec![44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
            vec![19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
            vec![9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0],
            vec![35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
        ];
        let v_b = vec![35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0];
        let v_e = vec![
            71.0 / 57600.0,
            0.0,
            -71.0 / 16695.0,
            71.0 / 1920.0,
            -17253.0 / 339200.0,
            22.0 / 525.0,
            -1.0 / 40.0,
        ];
        Self::build(v_a, v_b, Some(v_e), true)
    }

    pub fn rk4() -> Self {
        let v_a = vec![vec![], vec![0.5], vec![0.0, 0.5], vec![0.0, 0.0, 1.0]];
        let v_b = vec![1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0];
        Self::build(v_a, v_b, None, false)
    }

    pub fn stages(&self) -> usize {
        self.v_b.len()
    }
}

// ----------------------------------------
// Tape
// ----------------------------------------

#[derive(Clone, Debug)]
pub struct StepRecord {
    d_h: f32,
    v_stage_inputs: Vec<Option<Array2<f32>>>,
}

#[derive(Clone, Debug, Default)]
pub struct IntervalTape {
    v_steps: Vec<StepRecord>,
    i_rejected: usize,
}

impl IntervalTape {
    pub fn accepted_steps(&self) -> usize {
        self.v_steps.len()
    }

    pub fn rejected_steps(&self) -> usize {
        self.i_rejected
    }
}

// ----------------------------------------
// Solver
// ----------------------------------------

struct StepResult {
    a_y_next: Array2<f32>,
    v_k: Vec<Array2<f32>>,
    v_stage_inputs: Vec<Option<Array2<f32>>>,
}

#[derive(Clone, Debug)]
pub struct Solver {
    cfg: SolverConfig,
    tableau: Tableau,
}

impl Solver {
    pub fn new(cfg: &SolverConfig) -> Result<Self> {
        cfg.validate()?;
        let tableau = match cfg.method {
            SolverMethod::Dopri5 => Tableau::dopri5(),
            SolverMethod::Rk4 => Tableau::rk4(),
        };
        Ok(Self {
            cfg: cfg.clone(),
            tableau,
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.cfg
    }

    // Integrates from s = 0 to s = 1 and returns the end state plus the tape for backward.
    pub fn integrate<F: VectorField>(
        &self,
        field: &F,
        a_y0: &Array2<f32>,
        i_interval: usize,
    ) -> std::result::Result<(Array2<f32>, IntervalTape), SolverError> {
        if !math::all_finite(a_y0) {
            return Err(SolverError::NonFiniteState { i_interval, i_stage: 0 });
        }
        let r = match self.cfg.method {
            SolverMethod::Rk4 => self.integrate_fixed(field, a_y0, i_interval),
            SolverMethod::Dopri5 => self.integrate_adaptive(field, a_y0, i_interval),
        };
        if let Ok((_, tape)) = &r {
            debug!(
                i_interval,
                i_accepted = tape.accepted_steps(),
                i_rejected = tape.rejected_steps(),
                "interval integrated"
            );
        }
        r
    }

    fn integrate_fixed<F: VectorField>(
        &self,
        field: &F,
        a_y0: &Array2<f32>,
        i_interval: usize,
    ) -> std::result::Result<(Array2<f32>, IntervalTape), SolverError> {
        let i_n = self.cfg.i_rk4_substeps;
        let d_h = 1.0 / i_n as f32;
        let mut a_y = a_y0.clone();
        let mut tape = IntervalTape::default();
        for _ in 0..i_n {
            let step = self.rk_step(field, &a_y, None, d_h, i_interval)?;
            tape.v_steps.push(StepRecord {
                d_h,
                v_stage_inputs: step.v_stage_inputs,
            });
            a_y = step.a_y_next;
        }
        Ok((a_y, tape))
    }

    fn integrate_adaptive<F: VectorField>(
        &self,
        field: &F,
        a_y0: &Array2<f32>,
        i_interval: usize,
    ) -> std::result::Result<(Array2<f32>, IntervalTape), SolverError> {
        let d_rtol = self.cfg.d_rtol;
        let d_atol = self.cfg.d_atol;

        let mut a_y = a_y0.clone();
        let mut tape = IntervalTape::default();
        let mut d_s: f32 = 0.0;

        let mut a_k1 = field.eval(&a_y);
        if !math::all_finite(&a_k1) {
            return Err(SolverError::NonFiniteState { i_interval, i_stage: 0 });
        }
        let mut d_h = self.initial_step(field, &a_y, &a_k1, i_interval)?;
        let mut i_attempts: usize = 0;

        while 1.0 - d_s > 4.0 * f32::EPSILON {
            if i_attempts >= self.cfg.i_max_steps {
                return Err(SolverError::MaxStepsExceeded {
                    i_interval,
                    i_steps: i_attempts,
                });
            }
            i_attempts += 1;

            let d_h_step = d_h.min(1.0 - d_s);
            let step = self.rk_step(field, &a_y, Some(&a_k1), d_h_step, i_interval)?;
            let d_err = self.error_norm(&step.v_k, d_h_step, &a_y, &step.a_y_next, d_rtol, d_atol);

            if !d_err.is_finite() {
                return Err(SolverError::NonFiniteState {
                    i_interval,
                    i_stage: self.tableau.stages(),
                });
            }

            let d_factor = if d_err == 0.0 {
                10.0
            } else {
                (0.9 * d_err.powf(-0.2)).clamp(0.2, 10.0)
            };

            if d_err <= 1.0 {
                d_s += d_h_step;
                a_k1 = if self.tableau.b_fsal {
                    step.v_k[self.tableau.stages() - 1].clone()
                } else {
                    field.eval(&step.a_y_next)
                };
                tape.v_steps.push(StepRecord {
                    d_h: d_h_step,
                    v_stage_inputs: step.v_stage_inputs,
                });
                a_y = step.a_y_next;
                d_h = d_h_step * d_factor;
            } else {
                tape.i_rejected += 1;
                d_h = d_h_step * d_factor.min(1.0);
                if d_h < self.cfg.d_min_step {
                    return Err(SolverError::StepSizeUnderflow { i_interval, d_h });
                }
            }
        }

        Ok((a_y, tape))
    }

    // Hairer, Norsett, Wanner: starting step size from two field evaluations.
    fn initial_step<F: VectorField>(
        &self,
        field: &F,
        a_y0: &Array2<f32>,
        a_f0: &Array2<f32>,
        i_interval: usize,
    ) -> std::result::Result<f32, SolverError> {
        let a_scale = a_y0.mapv(|y| self.cfg.d_atol + y.abs() * self.cfg.d_rtol);
        let d0 = rms_scaled(a_y0, &a_scale);
        let d1 = rms_scaled(a_f0, &a_scale);
        let d_h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-3 } else { 0.01 * d0 / d1 };

        let a_y1 = a_y0 + &(a_f0 * d_h0);
        let a_f1 = field.eval(&a_y1);
        if !math::all_finite(&a_f1) {
            return Err(SolverError::NonFiniteState { i_interval, i_stage: 0 });
        }
        let d2 = rms_scaled(&(&a_f1 - a_f0), &a_scale) / d_h0;

        let d_max = d1.max(d2);
        let d_h1 = if d_max <= 1e-15 {
            (d_h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d_max).powf(0.2)
        };
        Ok((100.0 * d_h0).min(d_h1).min(1.0).max(self.cfg.d_min_step))
    }

    fn error_norm(
        &self,
        v_k: &[Array2<f32>],
        d_h: f32,
        a_y: &Array2<f32>,
        a_y_next: &Array2<f32>,
        d_rtol: f32,
        d_atol: f32,
    ) -> f32 {
        let v_e = match &self.tableau.opt_e {
            Some(v_e) => v_e,
            None => return 0.0,
        };
        let mut a_err = Array2::<f32>::zeros(a_y.raw_dim());
        for (a_k, &d_e) in v_k.iter().zip(v_e.iter()) {
            if d_e != 0.0 {
                a_err.scaled_add(d_h * d_e, a_k);
            }
        }
        let a_scale = ndarray::Zip::from(a_y)
            .and(a_y_next)
            .map_collect(|&y0, &y1| d_atol + d_rtol * y0.abs().max(y1.abs()));
        rms_scaled(&a_err, &a_scale)
    }

    fn rk_step<F: VectorField>(
        &self,
        field: &F,
        a_y: &Array2<f32>,
        opt_k1: Option<&Array2<f32>>,
        d_h: f32,
        i_interval: usize,
    ) -> std::result::Result<StepResult, SolverError> {
        let tab = &self.tableau;
        let i_stages = tab.stages();
        let mut v_k: Vec<Array2<f32>> = Vec::with_capacity(i_stages);
        let mut v_stage_inputs: Vec<Option<Array2<f32>>> = Vec::with_capacity(i_stages);

        for i_stage in 0..i_stages {
            let mut a_yi = a_y.clone();
            for (a_k, &d_a) in v_k.iter().zip(tab.v_a[i_stage].iter()) {
                if d_a != 0.0 {
                    a_yi.scaled_add(d_h * d_a, a_k);
                }
            }
            let a_ki = match (i_stage, opt_k1) {
                (0, Some(a_k1)) => a_k1.clone(),
                _ => field.eval(&a_yi),
            };
            if !math::all_finite(&a_ki) {
                return Err(SolverError::NonFiniteState { i_interval, i_stage });
            }
            v_stage_inputs.push(if tab.v_needed[i_stage] { Some(a_yi) } else { None });
            v_k.push(a_ki);
        }

        let mut a_y_next = a_y.clone();
        for (a_k, &d_b) in v_k.iter().zip(tab.v_b.iter()) {
            if d_b != 0.0 {
                a_y_next.scaled_add(d_h * d_b, a_k);
            }
        }
        if !math::all_finite(&a_y_next) {
            return Err(SolverError::NonFiniteState {
                i_interval,
                i_stage: i_stages,
            });
        }

        Ok(StepResult {
            a_y_next,
            v_k,
            v_stage_inputs,
        })
    }

    // Maps dL/dy(s=1) to dL/dy(s=0) and accumulates the field's parameter gradients.
    pub fn backward<F: VectorField>(
        &self,
        field: &mut F,
        tape: &IntervalTape,
        a_grad_end: &Array2<f32>,
    ) -> Array2<f32> {
        let tab = &self.tableau;
        let i_stages = tab.stages();
        let mut a_gy = a_grad_end.clone();

        for step in tape.v_steps.iter().rev() {
            let d_h = step.d_h;
            let mut v_gk: Vec<Option<Array2<f32>>> = tab
                .v_b
                .iter()
                .map(|&d_b| if d_b != 0.0 { Some(&a_gy * (d_h * d_b)) } else { None })
                .collect();
            let mut a_gy_prev = a_gy.clone();

            for i_stage in (0..i_stages).rev() {
                let a_gk = match v_gk[i_stage].take() {
                    Some(a_gk) => a_gk,
                    None => continue,
                };
                let a_yi = match &step.v_stage_inputs[i_stage] {
                    Some(a_yi) => a_yi,
                    None => continue,
                };
                let a_g_yi = field.vjp(a_yi, &a_gk);
                a_gy_prev += &a_g_yi;
                for (j, &d_a) in tab.v_a[i_stage].iter().enumerate() {
                    if d_a == 0.0 {
                        continue;
                    }
                    let a_contrib = &a_g_yi * (d_h * d_a);
                    match &mut v_gk[j] {
                        Some(a_acc) => *a_acc += &a_contrib,
                        slot => *slot = Some(a_contrib),
                    }
                }
            }
            a_gy = a_gy_prev;
        }
        a_gy
    }
}

fn rms_scaled(a_x: &Array2<f32>, a_scale: &Array2<f32>) -> f32 {
    if a_x.is_empty() {
        return 0.0;
    }
    let d_sum: f32 = ndarray::Zip::from(a_x)
        .and(a_scale)
        .fold(0.0, |acc, &x, &s| acc + (x / s) * (x / s));
    (d_sum / a_x.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    // dz/ds = lambda * z
    struct Linear1 {
        d_lambda: f32,
        d_grad_lambda: f32,
    }

    impl VectorField for Linear1 {
        fn eval(&self, a_z: &Array2<f32>) -> Array2<f32> {
            a_z * self.d_lambda
        }

        fn vjp(&mut self, a_z: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32> {
            self.d_grad_lambda += (a_z * a_grad).sum();
            a_grad * self.d_lambda
        }
    }

    struct Blowup;

    impl VectorField for Blowup {
        fn eval(&self, a_z: &Array2<f32>) -> Array2<f32> {
            a_z.mapv(|_| f32::NAN)
        }

        fn vjp(&mut self, _a_z: &Array2<f32>, a_grad: &Array2<f32>) -> Array2<f32> {
            a_grad.clone()
        }
    }

    fn field(d_lambda: f32) -> Linear1 {
        Linear1 {
            d_lambda,
            d_grad_lambda: 0.0,
        }
    }

    #[test]
    fn dopri5_matches_exponential_decay() {
        let solver = Solver::new(&SolverConfig::default()).unwrap();
        let (a_y, tape) = solver.integrate(&field(-1.0), &array![[1.0_f32, 2.0]], 0).unwrap();
        let d_e = (-1.0_f32).exp();
        assert_abs_diff_eq!(a_y[[0, 0]], d_e, epsilon = 1e-3);
        assert_abs_diff_eq!(a_y[[0, 1]], 2.0 * d_e, epsilon = 2e-3);
        assert!(tape.accepted_steps() >= 1);
    }

    #[test]
    fn rk4_matches_exponential_growth() {
        let cfg = SolverConfig {
            method: SolverMethod::Rk4,
            i_rk4_substeps: 8,
            ..SolverConfig::default()
        };
        let solver = Solver::new(&cfg).unwrap();
        let (a_y, tape) = solver.integrate(&field(0.5), &array![[1.0_f32]], 0).unwrap();
        assert_abs_diff_eq!(a_y[[0, 0]], 0.5_f32.exp(), epsilon = 1e-5);
        assert_eq!(tape.accepted_steps(), 8);
    }

    #[test]
    fn backward_matches_analytic_sensitivity() {
        for method in [SolverMethod::Dopri5, SolverMethod::Rk4] {
            let cfg = SolverConfig {
                method,
                ..SolverConfig::default()
            };
            let solver = Solver::new(&cfg).unwrap();
            let mut f = field(-0.7);
            let a_y0 = array![[1.5_f32]];
            let (_, tape) = solver.integrate(&f, &a_y0, 0).unwrap();
            let a_g0 = solver.backward(&mut f, &tape, &array![[1.0_f32]]);

            // y(1) = y0 exp(lambda): dy/dy0 = exp(lambda), dy/dlambda = y0 exp(lambda).
            let d_e = (-0.7_f32).exp();
            assert_abs_diff_eq!(a_g0[[0, 0]], d_e, epsilon = 2e-3);
            assert_abs_diff_eq!(f.d_grad_lambda, 1.5 * d_e, epsilon = 5e-3);
        }
    }

    #[test]
    fn time_scaling_stretches_each_row() {
        let cfg = SolverConfig {
            method: SolverMethod::Rk4,
            i_rk4_substeps: 16,
            ..SolverConfig::default()
        };
        let solver = Solver::new(&cfg).unwrap();
        let mut inner = field(-1.0);
        let a_dt = array![[0.5_f32], [2.0]];
        let scaled = TimeScaled {
            field: &mut inner,
            a_dt: &a_dt,
        };
        let (a_y, _) = solver.integrate(&scaled, &array![[1.0_f32], [1.0]], 0).unwrap();
        assert_abs_diff_eq!(a_y[[0, 0]], (-0.5_f32).exp(), epsilon = 1e-5);
        assert_abs_diff_eq!(a_y[[1, 0]], (-2.0_f32).exp(), epsilon = 1e-4);
    }

    #[test]
    fn step_budget_exhaustion_is_an_error() {
        let cfg = SolverConfig {
            i_max_steps: 2,
            ..SolverConfig::default()
        };
        let solver = Solver::new(&cfg).unwrap();
        let r = solver.integrate(&field(-200.0), &array![[1.0_f32]], 3);
        assert!(matches!(
            r,
            Err(SolverError::MaxStepsExceeded { i_interval: 3, .. })
        ));
    }

    #[test]
    fn non_finite_stage_is_an_error() {
        let solver = Solver::new(&SolverConfig::default()).unwrap();
        let r = solver.integrate(&Blowup, &array![[1.0_f32]], 1);
        assert!(matches!(r, Err(SolverError::NonFiniteState { i_interval: 1, .. })));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = SolverConfig {
            d_rtol: 0.0,
            ..SolverConfig::default()
        };
        assert!(Solver::new(&cfg).is_err());
    }
}
