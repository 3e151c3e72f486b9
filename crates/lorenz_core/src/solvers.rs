use crate::error::{require_positive, LorenzError, LorenzResult};
use crate::parameters::IntegrationMethod;
use crate::traits::{DynamicalSystem, Scalar, Steppable};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Forward Euler, first order.
pub struct Euler<T: Scalar> {
    k1: Vec<T>,
}

impl<T: Scalar> Euler<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Euler<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        system.apply(*t, state, &mut self.k1);
        for i in 0..state.len() {
            state[i] = state[i] + dt * self.k1[i];
        }
        *t = *t + dt;
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let two = T::one() + T::one();
        let half = T::one() / two;
        let sixth = T::one() / (two + two + two);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Accept/reject policy shared by the adaptive integrators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    /// Upper bound on the local error estimate of an accepted step.
    pub tolerance: f64,
    pub safety: f64,
    /// Smallest shrink factor applied after a rejection.
    pub min_factor: f64,
    /// Largest growth factor applied after an acceptance.
    pub max_factor: f64,
    pub min_step: f64,
    pub max_step: f64,
    /// Rejections tolerated within a single step before giving up.
    pub max_retries: usize,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
            min_step: 1e-10,
            max_step: 1.0,
            max_retries: 50,
        }
    }
}

impl AdaptiveSettings {
    pub fn validate(&self) -> LorenzResult<()> {
        require_positive("tolerance", self.tolerance)?;
        require_positive("min_step", self.min_step)?;
        require_positive("max_step", self.max_step)?;
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(LorenzError::validation(
                "safety",
                format!("must lie in (0, 1] (got {})", self.safety),
            ));
        }
        if !(self.min_factor > 0.0 && self.min_factor <= 0.5) {
            return Err(LorenzError::validation(
                "min_factor",
                format!("must lie in (0, 0.5] (got {})", self.min_factor),
            ));
        }
        if !(self.max_factor >= 1.0 && self.max_factor.is_finite()) {
            return Err(LorenzError::validation(
                "max_factor",
                format!("must be finite and at least 1 (got {})", self.max_factor),
            ));
        }
        if self.min_step > self.max_step {
            return Err(LorenzError::validation(
                "min_step",
                format!(
                    "must not exceed max_step ({} > {})",
                    self.min_step, self.max_step
                ),
            ));
        }
        Ok(())
    }
}

/// Outcome of evaluating one trial step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepDecision {
    Accept { next_dt: f64 },
    Reject { retry_dt: f64 },
}

/// Step-size controller: factor = safety * (tol / err)^(1 / (q + 1)).
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveController {
    settings: AdaptiveSettings,
    exponent: f64,
}

impl AdaptiveController {
    /// `error_order` is the order of the lower-order member of the pair.
    pub fn new(settings: AdaptiveSettings, error_order: usize) -> Self {
        Self {
            settings,
            exponent: 1.0 / (error_order as f64 + 1.0),
        }
    }

    pub fn settings(&self) -> &AdaptiveSettings {
        &self.settings
    }

    pub fn decide(&self, dt: f64, error: f64) -> StepDecision {
        let s = &self.settings;
        if error.is_finite() && error <= s.tolerance {
            let factor = if error == 0.0 {
                s.max_factor
            } else {
                (s.safety * (s.tolerance / error).powf(self.exponent)).clamp(1.0, s.max_factor)
            };
            StepDecision::Accept {
                next_dt: (dt * factor).min(s.max_step),
            }
        } else {
            let factor = if error.is_finite() {
                (s.safety * (s.tolerance / error).powf(self.exponent)).clamp(s.min_factor, 0.5)
            } else {
                s.min_factor
            };
            StepDecision::Reject {
                retry_dt: dt * factor,
            }
        }
    }
}

/// A pair of solutions of different order computed from one trial step.
pub trait EmbeddedPair {
    /// Order of the lower-order member.
    fn error_order(&self) -> usize;

    /// Advances `state` by `dt` into `out` (the higher-order solution) and
    /// returns the local error estimate.
    fn attempt<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
    ) -> f64;

    /// Called once the most recent attempt has been accepted.
    fn commit(&mut self) {}
}

fn is_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Max-norm of `high - low`, scaled per component by `1 + max(|y0|, |high|)`.
pub fn error_norm(y0: &[f64], low: &[f64], high: &[f64]) -> f64 {
    let mut norm = 0.0f64;
    for i in 0..y0.len() {
        let scale = 1.0 + y0[i].abs().max(high[i].abs());
        let e = (high[i] - low[i]).abs() / scale;
        if e.is_nan() {
            return f64::NAN;
        }
        norm = norm.max(e);
    }
    norm
}

/// RK4 step doubling: one full step against two half steps.
pub struct StepDoubling {
    rk4: RK4<f64>,
    full: Vec<f64>,
}

impl StepDoubling {
    pub fn new(dim: usize) -> Self {
        Self {
            rk4: RK4::new(dim),
            full: vec![0.0; dim],
        }
    }
}

impl EmbeddedPair for StepDoubling {
    fn error_order(&self) -> usize {
        4
    }

    fn attempt<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
    ) -> f64 {
        self.full.copy_from_slice(state);
        let mut t_full = t;
        self.rk4.step(system, &mut t_full, &mut self.full, dt);

        out.copy_from_slice(state);
        let mut t_half = t;
        self.rk4.step(system, &mut t_half, out, 0.5 * dt);
        self.rk4.step(system, &mut t_half, out, 0.5 * dt);

        error_norm(state, &self.full, out)
    }
}

const DP_C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

// The last row doubles as the 5th order weights (FSAL).
#[rustfmt::skip]
const DP_A: [&[f64]; 6] = [
    &[1.0 / 5.0],
    &[3.0 / 40.0, 9.0 / 40.0],
    &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
    &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
    &[9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0],
    &[35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
];

/// Difference between the 5th and embedded 4th order weights.
const DP_E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

/// Continuous extension coefficients (Hairer, Nørsett & Wanner).
const DP_D: [f64; 7] = [
    -12715105075.0 / 11282082432.0,
    0.0,
    87487479700.0 / 32700410799.0,
    -10690763975.0 / 1880347072.0,
    701980252875.0 / 199316789632.0,
    -1453857185.0 / 822651844.0,
    69997945.0 / 29380423.0,
];

/// Stage derivatives and endpoints of one accepted step.
struct DenseStep {
    k: [Vec<f64>; 7],
    y0: Vec<f64>,
    y1: Vec<f64>,
    dt: f64,
}

/// Dormand-Prince 5(4) pair with dense output over the last accepted step.
pub struct DormandPrince54 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    low: Vec<f64>,
    y0: Vec<f64>,
    y1: Vec<f64>,
    attempted_dt: f64,
    dense: DenseStep,
}

impl DormandPrince54 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
            low: vec![0.0; dim],
            y0: vec![0.0; dim],
            y1: vec![0.0; dim],
            attempted_dt: 0.0,
            dense: DenseStep {
                k: std::array::from_fn(|_| vec![0.0; dim]),
                y0: vec![0.0; dim],
                y1: vec![0.0; dim],
                dt: 0.0,
            },
        }
    }

    /// Evaluates the 4th order continuous extension at `theta` in [0, 1]
    /// across the last accepted step. Returns `false` before any step was
    /// accepted.
    pub fn interpolate(&self, theta: f64, out: &mut [f64]) -> bool {
        let dense = &self.dense;
        if dense.dt == 0.0 {
            return false;
        }
        let h = dense.dt;
        let theta1 = 1.0 - theta;
        for i in 0..out.len() {
            let r1 = dense.y0[i];
            let r2 = dense.y1[i] - dense.y0[i];
            let r3 = h * dense.k[0][i] - r2;
            let r4 = r2 - h * dense.k[6][i] - r3;
            let mut r5 = 0.0;
            for (stage, d) in DP_D.iter().enumerate() {
                r5 += d * dense.k[stage][i];
            }
            r5 *= h;
            out[i] = r1 + theta * (r2 + theta1 * (r3 + theta * (r4 + theta1 * r5)));
        }
        true
    }
}

impl EmbeddedPair for DormandPrince54 {
    fn error_order(&self) -> usize {
        4
    }

    fn attempt<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
    ) -> f64 {
        let dim = state.len();
        system.apply(t, state, &mut self.k[0]);
        for stage in 1..7 {
            let row = DP_A[stage - 1];
            for i in 0..dim {
                let mut acc = 0.0;
                for (j, a) in row.iter().enumerate() {
                    acc += a * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            system.apply(t + DP_C[stage] * dt, &self.tmp, &mut self.k[stage]);
            if stage == 6 {
                // The last stage is evaluated at the 5th order solution.
                out.copy_from_slice(&self.tmp);
            }
        }

        for i in 0..dim {
            let mut err = 0.0;
            for (stage, e) in DP_E.iter().enumerate() {
                err += e * self.k[stage][i];
            }
            self.low[i] = out[i] - dt * err;
        }

        self.y0.copy_from_slice(state);
        self.y1.copy_from_slice(out);
        self.attempted_dt = dt;

        error_norm(state, &self.low, out)
    }

    fn commit(&mut self) {
        for (saved, stage) in self.dense.k.iter_mut().zip(&self.k) {
            saved.copy_from_slice(stage);
        }
        self.dense.y0.copy_from_slice(&self.y0);
        self.dense.y1.copy_from_slice(&self.y1);
        self.dense.dt = self.attempted_dt;
    }
}

/// Result of one accepted adaptive step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveStep {
    pub dt_used: f64,
    pub error: f64,
    pub next_dt: f64,
    pub rejected: usize,
}

/// Drives an [`EmbeddedPair`] through Propose → Evaluate → Accept | Reject-Shrink
/// until a step is accepted or the retry budget is spent.
pub struct AdaptiveStepper<P: EmbeddedPair> {
    pair: P,
    controller: AdaptiveController,
    trial: Vec<f64>,
}

impl<P: EmbeddedPair> AdaptiveStepper<P> {
    pub fn new(pair: P, dim: usize, settings: AdaptiveSettings) -> Self {
        let controller = AdaptiveController::new(settings, pair.error_order());
        Self {
            pair,
            controller,
            trial: vec![0.0; dim],
        }
    }

    pub fn pair(&self) -> &P {
        &self.pair
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    pub fn step<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> LorenzResult<AdaptiveStep> {
        let settings = *self.controller.settings();
        // The floor only bounds controller shrinkage; a short requested step
        // (e.g. clamped to a horizon) is attempted as given.
        let mut h = dt.min(settings.max_step);
        let mut rejected = 0usize;
        loop {
            let error = self.pair.attempt(system, *t, state, h, &mut self.trial);
            match self.controller.decide(h, error) {
                StepDecision::Accept { next_dt } => {
                    self.pair.commit();
                    state.copy_from_slice(&self.trial);
                    *t += h;
                    return Ok(AdaptiveStep {
                        dt_used: h,
                        error,
                        next_dt,
                        rejected,
                    });
                }
                StepDecision::Reject { retry_dt } => {
                    rejected += 1;
                    trace!(t = *t, dt = h, error, retry_dt, "adaptive step rejected");
                    let exhausted =
                        !(retry_dt >= settings.min_step) || rejected >= settings.max_retries;
                    if exhausted && !is_finite(&self.trial) {
                        // No admissible step keeps the state finite: hand the
                        // blow-up back so the caller can flag divergence.
                        self.pair.commit();
                        state.copy_from_slice(&self.trial);
                        *t += h;
                        return Ok(AdaptiveStep {
                            dt_used: h,
                            error,
                            next_dt: h,
                            rejected,
                        });
                    }
                    if !(retry_dt >= settings.min_step) {
                        return Err(LorenzError::integration(
                            *t,
                            retry_dt,
                            format!(
                                "step size fell below the minimum of {:e}",
                                settings.min_step
                            ),
                        ));
                    }
                    if rejected >= settings.max_retries {
                        return Err(LorenzError::integration(
                            *t,
                            h,
                            format!(
                                "error tolerance {:e} not met after {} retries (last error {:e})",
                                settings.tolerance, rejected, error
                            ),
                        ));
                    }
                    h = retry_dt;
                }
            }
        }
    }
}

/// Report for one call to [`Integrator::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub dt_used: f64,
    /// Step to propose next; equals `dt_used` for fixed-step methods.
    pub next_dt: f64,
    /// Local error estimate, adaptive methods only.
    pub error: Option<f64>,
    pub rejected: usize,
}

/// The closed set of integration schemes, selected from an [`IntegrationMethod`].
pub enum Integrator {
    Euler(Euler<f64>),
    Rk4(RK4<f64>),
    Adaptive(AdaptiveStepper<StepDoubling>),
    DormandPrince54(AdaptiveStepper<DormandPrince54>),
}

impl Integrator {
    pub fn new(method: IntegrationMethod, dim: usize, settings: AdaptiveSettings) -> Self {
        match method {
            IntegrationMethod::Euler => Integrator::Euler(Euler::new(dim)),
            IntegrationMethod::Rk4 => Integrator::Rk4(RK4::new(dim)),
            IntegrationMethod::Adaptive => {
                Integrator::Adaptive(AdaptiveStepper::new(StepDoubling::new(dim), dim, settings))
            }
            IntegrationMethod::DormandPrince54 => Integrator::DormandPrince54(
                AdaptiveStepper::new(DormandPrince54::new(dim), dim, settings),
            ),
        }
    }

    pub fn method(&self) -> IntegrationMethod {
        match self {
            Integrator::Euler(_) => IntegrationMethod::Euler,
            Integrator::Rk4(_) => IntegrationMethod::Rk4,
            Integrator::Adaptive(_) => IntegrationMethod::Adaptive,
            Integrator::DormandPrince54(_) => IntegrationMethod::DormandPrince54,
        }
    }

    pub fn advance<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> LorenzResult<StepReport> {
        let fixed = StepReport {
            dt_used: dt,
            next_dt: dt,
            error: None,
            rejected: 0,
        };
        match self {
            Integrator::Euler(s) => {
                s.step(system, t, state, dt);
                Ok(fixed)
            }
            Integrator::Rk4(s) => {
                s.step(system, t, state, dt);
                Ok(fixed)
            }
            Integrator::Adaptive(s) => s.step(system, t, state, dt).map(StepReport::from),
            Integrator::DormandPrince54(s) => s.step(system, t, state, dt).map(StepReport::from),
        }
    }
}

impl From<AdaptiveStep> for StepReport {
    fn from(step: AdaptiveStep) -> Self {
        StepReport {
            dt_used: step.dt_used,
            next_dt: step.next_dt,
            error: Some(step.error),
            rejected: step.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AdaptiveController, AdaptiveSettings, AdaptiveStepper, DormandPrince54, EmbeddedPair,
        Euler, Integrator, StepDecision, StepDoubling, RK4,
    };
    use crate::error::LorenzError;
    use crate::parameters::{IntegrationMethod, ParameterSet};
    use crate::system::LorenzSystem;
    use crate::traits::{DynamicalSystem, Steppable};
    use proptest::prelude::*;

    #[derive(Clone, Copy)]
    struct LinearSystem {
        rate: f64,
    }

    impl DynamicalSystem<f64> for LinearSystem {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = self.rate * x[0];
        }
    }

    fn classical() -> LorenzSystem {
        LorenzSystem::new(ParameterSet::classical())
    }

    fn integrate_rk4(system: &LorenzSystem, start: [f64; 3], dt: f64, steps: usize) -> [f64; 3] {
        let mut stepper = RK4::new(3);
        let mut state = start;
        let mut t = 0.0;
        for _ in 0..steps {
            stepper.step(system, &mut t, &mut state, dt);
        }
        state
    }

    fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn euler_takes_a_single_derivative_step() {
        let system = classical();
        let mut state = [1.0f64, 1.0, 1.0];
        let mut t = 0.0f64;
        Euler::new(3).step(&system, &mut t, &mut state, 0.1f64);
        assert!((state[0] - 1.0).abs() < 1e-12);
        assert!((state[1] - 3.6).abs() < 1e-12);
        assert!((state[2] - (1.0 + 0.1 * (1.0 - 8.0 / 3.0))).abs() < 1e-12);
        assert!((t - 0.1).abs() < 1e-15);
    }

    #[test]
    fn rk4_matches_exponential_decay() {
        let system = LinearSystem { rate: -1.0 };
        let mut state = [1.0];
        let mut t = 0.0;
        let mut rk4 = RK4::new(1);
        for _ in 0..10 {
            rk4.step(&system, &mut t, &mut state, 0.1);
        }
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn rk4_converges_at_fourth_order() {
        let system = classical();
        let start = [1.0, 1.0, 1.0];
        let horizon = 0.5;
        let reference = integrate_rk4(&system, start, horizon / 5000.0, 5000);
        let coarse = integrate_rk4(&system, start, horizon / 25.0, 25);
        let fine = integrate_rk4(&system, start, horizon / 50.0, 50);
        let order = (distance(&coarse, &reference) / distance(&fine, &reference)).log2();
        assert!(order >= 3.5, "empirical order {order}");
    }

    #[test]
    fn euler_converges_at_first_order() {
        let system = LinearSystem { rate: -1.0 };
        let run = |steps: usize| {
            let mut state = [1.0];
            let mut t = 0.0;
            let mut euler = Euler::new(1);
            for _ in 0..steps {
                euler.step(&system, &mut t, &mut state, 1.0 / steps as f64);
            }
            (state[0] - (-1.0f64).exp()).abs()
        };
        let order = (run(200) / run(400)).log2();
        assert!((order - 1.0).abs() < 0.1, "empirical order {order}");
    }

    #[test]
    fn controller_accepts_only_within_tolerance() {
        let controller = AdaptiveController::new(AdaptiveSettings::default(), 4);
        match controller.decide(0.01, 1e-7) {
            StepDecision::Accept { next_dt } => assert!(next_dt >= 0.01),
            other => panic!("expected acceptance, got {other:?}"),
        }
        match controller.decide(0.01, 0.0) {
            StepDecision::Accept { next_dt } => assert!((next_dt - 0.05).abs() < 1e-15),
            other => panic!("expected acceptance, got {other:?}"),
        }
        assert!(matches!(
            controller.decide(0.01, 1e-5),
            StepDecision::Reject { .. }
        ));
        assert!(matches!(
            controller.decide(0.01, f64::NAN),
            StepDecision::Reject { retry_dt } if (retry_dt - 0.002).abs() < 1e-15
        ));
    }

    #[test]
    fn adaptive_settings_validation_names_field() {
        let bad = AdaptiveSettings {
            safety: 1.5,
            ..AdaptiveSettings::default()
        };
        assert_eq!(bad.validate().expect_err("invalid").field(), Some("safety"));
        let bad = AdaptiveSettings {
            min_factor: 0.8,
            ..AdaptiveSettings::default()
        };
        assert_eq!(bad.validate().expect_err("invalid").field(), Some("min_factor"));
        let bad = AdaptiveSettings {
            tolerance: 0.0,
            ..AdaptiveSettings::default()
        };
        assert_eq!(bad.validate().expect_err("invalid").field(), Some("tolerance"));
        assert!(AdaptiveSettings::default().validate().is_ok());
    }

    #[test]
    fn adaptive_step_fails_when_step_underflows() {
        let settings = AdaptiveSettings {
            tolerance: 1e-14,
            min_step: 0.5,
            ..AdaptiveSettings::default()
        };
        let mut stepper = AdaptiveStepper::new(StepDoubling::new(3), 3, settings);
        let mut state = [1.0, 1.0, 1.0];
        let mut t = 0.0;
        let err = stepper
            .step(&classical(), &mut t, &mut state, 1.0)
            .expect_err("tolerance cannot be met above the step floor");
        assert!(matches!(err, LorenzError::Integration { .. }));
        assert!(err.to_string().contains("minimum"), "unexpected error: {err}");
        assert_eq!(state, [1.0, 1.0, 1.0]);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn adaptive_step_fails_when_retries_exhausted() {
        let settings = AdaptiveSettings {
            tolerance: 1e-14,
            max_retries: 2,
            ..AdaptiveSettings::default()
        };
        let mut stepper = AdaptiveStepper::new(DormandPrince54::new(3), 3, settings);
        let mut state = [1.0, 1.0, 1.0];
        let mut t = 0.0;
        let err = stepper
            .step(&classical(), &mut t, &mut state, 1.0)
            .expect_err("retry budget should run out");
        assert!(err.to_string().contains("retries"), "unexpected error: {err}");
    }

    #[test]
    fn dormand_prince_tracks_exponential_decay() {
        let system = LinearSystem { rate: -1.0 };
        let mut stepper = AdaptiveStepper::new(
            DormandPrince54::new(1),
            1,
            AdaptiveSettings {
                tolerance: 1e-10,
                ..AdaptiveSettings::default()
            },
        );
        let mut state = [1.0];
        let mut t = 0.0;
        let mut dt = 0.1f64;
        while 2.0 - t > 1e-12 {
            let trial = dt.min(2.0 - t);
            let step = stepper
                .step(&system, &mut t, &mut state, trial)
                .expect("decay is easy to integrate");
            dt = step.next_dt;
        }
        assert!((t - 2.0).abs() < 1e-12);
        assert!((state[0] - (-2.0f64).exp()).abs() < 1e-8);
    }

    #[test]
    fn dormand_prince_dense_output_hits_endpoints_and_midpoint() {
        let system = LinearSystem { rate: -1.0 };
        let mut pair = DormandPrince54::new(1);
        let mut out = [0.0];
        assert!(!pair.interpolate(0.5, &mut out));

        let mut next = [0.0];
        pair.attempt(&system, 0.0, &[1.0], 0.2, &mut next);
        assert!(!pair.interpolate(0.5, &mut out), "nothing accepted yet");
        pair.commit();

        assert!(pair.interpolate(0.0, &mut out));
        assert!((out[0] - 1.0).abs() < 1e-15);
        pair.interpolate(1.0, &mut out);
        assert!((out[0] - next[0]).abs() < 1e-15);
        pair.interpolate(0.5, &mut out);
        assert!((out[0] - (-0.1f64).exp()).abs() < 1e-6, "midpoint {}", out[0]);
    }

    #[test]
    fn dense_output_ignores_rejected_attempts() {
        let system = LinearSystem { rate: -1.0 };
        let mut pair = DormandPrince54::new(1);
        let mut accepted = [0.0];
        pair.attempt(&system, 0.0, &[1.0], 0.2, &mut accepted);
        pair.commit();

        let mut discarded = [0.0];
        pair.attempt(&system, 0.2, &accepted, 5.0, &mut discarded);

        let mut out = [0.0];
        assert!(pair.interpolate(1.0, &mut out));
        assert!((out[0] - accepted[0]).abs() < 1e-15);
        pair.interpolate(0.5, &mut out);
        assert!((out[0] - (-0.1f64).exp()).abs() < 1e-6, "midpoint {}", out[0]);
    }

    #[test]
    fn stepper_commits_dense_output_on_acceptance() {
        let system = LinearSystem { rate: -1.0 };
        let mut stepper =
            AdaptiveStepper::new(DormandPrince54::new(1), 1, AdaptiveSettings::default());
        let mut state = [1.0];
        let mut t = 0.0;
        let step = stepper
            .step(&system, &mut t, &mut state, 0.05)
            .expect("decay is easy to integrate");
        let mut out = [0.0];
        assert!(stepper.pair().interpolate(1.0, &mut out));
        assert!((out[0] - state[0]).abs() < 1e-15);
        stepper.pair().interpolate(0.0, &mut out);
        assert!((out[0] - 1.0).abs() < 1e-15);
        assert_eq!(t, step.dt_used);
    }

    #[test]
    fn adaptive_step_hands_back_non_finite_state() {
        for settings in [
            AdaptiveSettings::default(),
            AdaptiveSettings {
                max_retries: 3,
                ..AdaptiveSettings::default()
            },
        ] {
            let mut doubling = AdaptiveStepper::new(StepDoubling::new(3), 3, settings);
            let mut dopri = AdaptiveStepper::new(DormandPrince54::new(3), 3, settings);
            for use_dp in [false, true] {
                let mut state = [1e155, 1e155, 1e155];
                let mut t = 0.0;
                let result = if use_dp {
                    dopri.step(&classical(), &mut t, &mut state, 0.01)
                } else {
                    doubling.step(&classical(), &mut t, &mut state, 0.01)
                };
                let step = result.expect("overflow is handed back, not reported as an error");
                assert!(state.iter().any(|v| !v.is_finite()), "state {state:?}");
                assert!(step.rejected > 0);
                assert!(t > 0.0);
            }
        }
    }

    #[test]
    fn short_requested_step_is_attempted_below_floor() {
        let settings = AdaptiveSettings {
            min_step: 1e-3,
            ..AdaptiveSettings::default()
        };
        let mut stepper = AdaptiveStepper::new(DormandPrince54::new(3), 3, settings);
        let mut state = [1.0, 1.0, 1.0];
        let mut t = 0.0;
        let step = stepper
            .step(&classical(), &mut t, &mut state, 2e-4)
            .expect("a short final step is not an underflow");
        assert_eq!(step.dt_used, 2e-4);
        assert_eq!(step.rejected, 0);
        assert_eq!(t, 2e-4);
    }

    #[test]
    fn integrator_reports_fixed_and_adaptive_steps() {
        let system = classical();
        for method in IntegrationMethod::ALL {
            let mut integrator = Integrator::new(method, 3, AdaptiveSettings::default());
            assert_eq!(integrator.method(), method);
            let mut state = [1.0, 1.0, 1.0];
            let mut t = 0.0;
            let report = integrator
                .advance(&system, &mut t, &mut state, 0.01)
                .expect("single step should succeed");
            assert!((t - report.dt_used).abs() < 1e-15);
            assert_eq!(report.error.is_some(), method.is_adaptive());
            if !method.is_adaptive() {
                assert_eq!(report.dt_used, 0.01);
                assert_eq!(report.rejected, 0);
            }
        }
    }

    proptest! {
        #[test]
        fn rk4_leaves_origin_fixed(
            dt in 1e-4f64..1.0,
            sigma in 0.1f64..50.0,
            rho in 0.1f64..100.0,
            beta in 0.1f64..10.0,
        ) {
            let system = LorenzSystem::new(ParameterSet::new(sigma, rho, beta).expect("positive"));
            let mut state = [0.0, 0.0, 0.0];
            let mut t = 0.0;
            RK4::new(3).step(&system, &mut t, &mut state, dt);
            prop_assert_eq!(state, [0.0, 0.0, 0.0]);
        }

        #[test]
        fn accepted_steps_respect_tolerance(
            x in -15.0f64..15.0,
            y in -15.0f64..15.0,
            z in 5.0f64..40.0,
            dt in 1e-3f64..0.2,
            use_dp in any::<bool>(),
        ) {
            let settings = AdaptiveSettings::default();
            let method = if use_dp {
                IntegrationMethod::DormandPrince54
            } else {
                IntegrationMethod::Adaptive
            };
            let mut integrator = Integrator::new(method, 3, settings);
            let mut state = [x, y, z];
            let mut t = 0.0;
            let report = integrator
                .advance(&classical(), &mut t, &mut state, dt)
                .expect("classical flow is integrable");
            let error = report.error.expect("adaptive methods report an error");
            prop_assert!(error <= settings.tolerance);
            prop_assert!(report.dt_used <= dt);
        }

        #[test]
        fn rejections_always_retry_smaller(dt in 1e-6f64..1.0, error in 1e-12f64..1e3) {
            let controller = AdaptiveController::new(AdaptiveSettings::default(), 4);
            match controller.decide(dt, error) {
                StepDecision::Accept { .. } => prop_assert!(error <= 1e-6),
                StepDecision::Reject { retry_dt } => {
                    prop_assert!(error > 1e-6);
                    prop_assert!(retry_dt < dt);
                    prop_assert!(retry_dt > 0.0);
                }
            }
        }
    }
}
