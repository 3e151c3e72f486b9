use crate::error::{require_positive, LorenzError, LorenzResult};
use crate::parameters::{InitialConditions, IntegrationMethod};
use crate::solvers::{AdaptiveSettings, Integrator};
use crate::system::LorenzSystem;
use crate::traits::{DynamicalSystem, Linearizable};
use nalgebra::linalg::QR;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LyapunovSettings {
    pub method: IntegrationMethod,
    /// Fixed step, or the initial trial step for adaptive methods.
    pub dt: f64,
    /// Steps (accepted steps for adaptive methods) of tangent integration.
    pub num_steps: usize,
    /// Steps between Gram-Schmidt re-orthonormalizations.
    pub renormalization_interval: usize,
    /// Steps of primal-only integration discarded before measuring.
    pub transient_steps: usize,
}

impl Default for LyapunovSettings {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Rk4,
            dt: 0.01,
            num_steps: 10_000,
            renormalization_interval: 10,
            transient_steps: 0,
        }
    }
}

impl LyapunovSettings {
    pub fn validate(&self) -> LorenzResult<()> {
        require_positive("dt", self.dt)?;
        if self.num_steps == 0 {
            return Err(LorenzError::validation(
                "num_steps",
                "must be at least one integration step",
            ));
        }
        if self.renormalization_interval == 0 {
            return Err(LorenzError::validation(
                "renormalization_interval",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LyapunovSpectrum {
    /// Exponents sorted in descending order.
    pub exponents: Vec<f64>,
    pub total_time: f64,
    pub renormalizations: usize,
}

impl LyapunovSpectrum {
    pub fn largest(&self) -> f64 {
        self.exponents.first().copied().unwrap_or(f64::NAN)
    }

    pub fn sum(&self) -> f64 {
        self.exponents.iter().sum()
    }

    pub fn kaplan_yorke_dimension(&self) -> f64 {
        kaplan_yorke(&self.exponents)
    }
}

/// Augments a flow with its variational equation `dΦ/dt = J(x) Φ`.
///
/// The state layout is `[x (n), Φ (n×n, row-major)]`; the columns of Φ are the
/// tangent vectors.
pub struct TangentSystem<'a, S> {
    inner: &'a S,
    dimension: usize,
}

impl<'a, S> TangentSystem<'a, S> {
    pub fn new(inner: &'a S, dim: usize) -> Self {
        Self {
            inner,
            dimension: dim,
        }
    }
}

impl<S> DynamicalSystem<f64> for TangentSystem<'_, S>
where
    S: DynamicalSystem<f64> + Linearizable,
{
    fn dimension(&self) -> usize {
        let n = self.dimension;
        n + n * n
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let n = self.dimension;
        self.inner.apply(t, &x[..n], &mut out[..n]);

        let mut jacobian = vec![0.0; n * n];
        self.inner.jacobian_into(&x[..n], &mut jacobian);

        let phi = &x[n..];
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += jacobian[i * n + k] * phi[k * n + j];
                }
                out[n + i * n + j] = sum;
            }
        }
    }
}

/// Lyapunov spectrum of the Lorenz flow started at `initial_conditions`,
/// using default adaptive settings when an adaptive method is requested.
pub fn lyapunov_exponents(
    system: &LorenzSystem,
    initial_conditions: &InitialConditions,
    settings: &LyapunovSettings,
) -> LorenzResult<LyapunovSpectrum> {
    lyapunov_spectrum(
        system,
        &initial_conditions.to_array(),
        settings,
        AdaptiveSettings::default(),
    )
}

/// Variational (Benettin) estimate of the full Lyapunov spectrum.
pub fn lyapunov_spectrum<S>(
    system: &S,
    initial_state: &[f64],
    settings: &LyapunovSettings,
    adaptive: AdaptiveSettings,
) -> LorenzResult<LyapunovSpectrum>
where
    S: DynamicalSystem<f64> + Linearizable,
{
    settings.validate()?;
    if settings.method.is_adaptive() {
        adaptive.validate()?;
    }
    if initial_state.is_empty() {
        return Err(LorenzError::validation(
            "initial_state",
            "must have positive dimension",
        ));
    }

    let dim = initial_state.len();
    let mut t = 0.0;
    let mut dt = settings.dt;

    let mut state = initial_state.to_vec();
    if settings.transient_steps > 0 {
        let mut primal = Integrator::new(settings.method, dim, adaptive);
        for _ in 0..settings.transient_steps {
            let report = primal.advance(system, &mut t, &mut state, dt)?;
            dt = report.next_dt;
        }
        ensure_finite(&state, t)?;
    }

    let aug_dim = dim + dim * dim;
    let mut augmented_state = vec![0.0; aug_dim];
    augmented_state[..dim].copy_from_slice(&state);
    for i in 0..dim {
        augmented_state[dim + i * dim + i] = 1.0;
    }

    let tangent_system = TangentSystem::new(system, dim);
    let mut integrator = Integrator::new(settings.method, aug_dim, adaptive);
    let mut accum = vec![0.0; dim];
    let mut since_last_qr = 0usize;
    let mut renormalizations = 0usize;
    let mut total_time = 0.0;

    for step in 1..=settings.num_steps {
        let report = integrator.advance(&tangent_system, &mut t, &mut augmented_state, dt)?;
        total_time += report.dt_used;
        dt = report.next_dt;
        since_last_qr += 1;
        ensure_finite(&augmented_state, t)?;

        if since_last_qr == settings.renormalization_interval || step == settings.num_steps {
            apply_qr(&mut augmented_state[dim..], dim, &mut accum)?;
            renormalizations += 1;
            since_last_qr = 0;
        }
    }

    if total_time <= 0.0 {
        return Err(LorenzError::Analysis {
            message: "total integration time is zero; cannot normalize exponents".into(),
        });
    }

    let mut exponents: Vec<f64> = accum.iter().map(|value| value / total_time).collect();
    exponents.sort_by(|a, b| b.total_cmp(a));
    debug!(
        method = %settings.method,
        total_time,
        renormalizations,
        ?exponents,
        "lyapunov spectrum estimated"
    );

    Ok(LyapunovSpectrum {
        exponents,
        total_time,
        renormalizations,
    })
}

fn ensure_finite(state: &[f64], t: f64) -> LorenzResult<()> {
    if state.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(LorenzError::Analysis {
            message: format!("trajectory became non-finite at t = {t}"),
        })
    }
}

/// Re-orthonormalizes the tangent vectors (columns of the row-major `phi_slice`)
/// and adds `ln |R_ii|` to `accum`.
fn apply_qr(phi_slice: &mut [f64], dim: usize, accum: &mut [f64]) -> LorenzResult<()> {
    if phi_slice.len() != dim * dim {
        return Err(LorenzError::Analysis {
            message: "tangent matrix slice has incorrect size".into(),
        });
    }
    let matrix = DMatrix::from_row_slice(dim, dim, phi_slice);
    let qr = QR::new(matrix);
    let (q, r) = qr.unpack();
    for i in 0..dim {
        let diag = r[(i, i)].abs();
        if diag <= f64::EPSILON {
            return Err(LorenzError::Analysis {
                message: "encountered near-singular R matrix during orthonormalization".into(),
            });
        }
        accum[i] += diag.ln();
    }
    // nalgebra is column-major; write Q back row-major.
    for i in 0..dim {
        for j in 0..dim {
            phi_slice[i * dim + j] = q[(i, j)];
        }
    }
    Ok(())
}

/// Kaplan-Yorke (Lyapunov) dimension of a spectrum.
pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    if exponents.is_empty() {
        return 0.0;
    }
    let mut sorted = exponents.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut partial = 0.0;
    let mut k = 0usize;
    for (idx, &lambda) in sorted.iter().enumerate() {
        let new_sum = partial + lambda;
        if new_sum >= 0.0 {
            partial = new_sum;
            k = idx + 1;
        } else {
            if lambda.abs() <= f64::EPSILON {
                return k as f64;
            }
            return k as f64 + partial / lambda.abs();
        }
    }

    k as f64
}
