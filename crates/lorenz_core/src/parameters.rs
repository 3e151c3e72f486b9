use crate::error::{require_positive, LorenzError, LorenzResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The (σ, ρ, β) triple defining the Lorenz vector field.
///
/// Values are validated on construction and never mutated afterwards; the
/// `with_*` helpers return a new set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameterSet")]
pub struct ParameterSet {
    sigma: f64,
    rho: f64,
    beta: f64,
}

#[derive(Deserialize)]
struct RawParameterSet {
    sigma: f64,
    rho: f64,
    beta: f64,
}

impl TryFrom<RawParameterSet> for ParameterSet {
    type Error = LorenzError;

    fn try_from(raw: RawParameterSet) -> LorenzResult<Self> {
        ParameterSet::new(raw.sigma, raw.rho, raw.beta)
    }
}

impl ParameterSet {
    pub fn new(sigma: f64, rho: f64, beta: f64) -> LorenzResult<Self> {
        Ok(Self {
            sigma: require_positive("sigma", sigma)?,
            rho: require_positive("rho", rho)?,
            beta: require_positive("beta", beta)?,
        })
    }

    /// Lorenz's original chaotic regime: σ = 10, ρ = 28, β = 8/3.
    pub fn classical() -> Self {
        Self {
            sigma: 10.0,
            rho: 28.0,
            beta: 8.0 / 3.0,
        }
    }

    pub fn periodic() -> Self {
        Self {
            rho: 24.0,
            ..Self::classical()
        }
    }

    /// Sub-critical regime (ρ < 1) where the origin is the global attractor.
    pub fn fixed_point() -> Self {
        Self {
            rho: 0.5,
            ..Self::classical()
        }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn with_sigma(&self, sigma: f64) -> LorenzResult<Self> {
        Self::new(sigma, self.rho, self.beta)
    }

    pub fn with_rho(&self, rho: f64) -> LorenzResult<Self> {
        Self::new(self.sigma, rho, self.beta)
    }

    pub fn with_beta(&self, beta: f64) -> LorenzResult<Self> {
        Self::new(self.sigma, self.rho, beta)
    }
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::classical()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "σ={:.3}, ρ={:.3}, β={:.3}",
            self.sigma, self.rho, self.beta
        )
    }
}

/// Starting point of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialConditions {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl InitialConditions {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Draws each coordinate from N(0, scale²) using a ChaCha stream keyed by
    /// `seed`. The same seed always yields the same point.
    pub fn random(scale: f64, seed: u64) -> LorenzResult<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self::sample(scale, &mut rng)
    }

    /// Like [`InitialConditions::random`] but drawn from the OS-seeded thread
    /// generator; not reproducible.
    pub fn true_random(scale: f64) -> LorenzResult<Self> {
        let mut rng = rand::rng();
        Self::sample(scale, &mut rng)
    }

    fn sample<R: Rng + ?Sized>(scale: f64, rng: &mut R) -> LorenzResult<Self> {
        if !scale.is_finite() || scale < 0.0 {
            return Err(LorenzError::validation(
                "scale",
                format!("must be finite and non-negative (got {scale})"),
            ));
        }
        let normal = Normal::new(0.0, scale)
            .map_err(|err| LorenzError::validation("scale", err.to_string()))?;
        Ok(Self {
            x: normal.sample(rng),
            y: normal.sample(rng),
            z: normal.sample(rng),
        })
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn from_array(values: [f64; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

impl From<[f64; 3]> for InitialConditions {
    fn from(values: [f64; 3]) -> Self {
        Self::from_array(values)
    }
}

impl From<InitialConditions> for [f64; 3] {
    fn from(ic: InitialConditions) -> Self {
        ic.to_array()
    }
}

/// Time-stepping scheme used by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IntegrationMethod {
    Euler,
    Rk4,
    /// RK4 step doubling with accept/reject control.
    Adaptive,
    DormandPrince54,
}

impl IntegrationMethod {
    pub const ALL: [IntegrationMethod; 4] = [
        IntegrationMethod::Euler,
        IntegrationMethod::Rk4,
        IntegrationMethod::Adaptive,
        IntegrationMethod::DormandPrince54,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationMethod::Euler => "euler",
            IntegrationMethod::Rk4 => "rk4",
            IntegrationMethod::Adaptive => "adaptive",
            IntegrationMethod::DormandPrince54 => "dp54",
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(
            self,
            IntegrationMethod::Adaptive | IntegrationMethod::DormandPrince54
        )
    }
}

impl FromStr for IntegrationMethod {
    type Err = LorenzError;

    fn from_str(s: &str) -> LorenzResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euler" => Ok(IntegrationMethod::Euler),
            "rk4" => Ok(IntegrationMethod::Rk4),
            "adaptive" | "step-doubling" => Ok(IntegrationMethod::Adaptive),
            "dp54" | "rk45" | "dopri5" => Ok(IntegrationMethod::DormandPrince54),
            other => {
                let names: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
                Err(LorenzError::validation(
                    "integration_method",
                    format!("must be one of {} (got {other:?})", names.join(", ")),
                ))
            }
        }
    }
}

impl TryFrom<String> for IntegrationMethod {
    type Error = LorenzError;

    fn try_from(value: String) -> LorenzResult<Self> {
        value.parse()
    }
}

impl From<IntegrationMethod> for String {
    fn from(method: IntegrationMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run configuration for [`Simulator::simulate`](crate::simulator::Simulator::simulate).
///
/// For adaptive methods `dt` is the initial trial step and `dt * num_steps`
/// the integration horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSimulationConfig")]
pub struct SimulationConfig {
    dt: f64,
    num_steps: usize,
    integration_method: IntegrationMethod,
    save_interval: usize,
}

#[derive(Deserialize)]
struct RawSimulationConfig {
    dt: f64,
    num_steps: i64,
    integration_method: String,
    save_interval: i64,
}

impl TryFrom<RawSimulationConfig> for SimulationConfig {
    type Error = LorenzError;

    fn try_from(raw: RawSimulationConfig) -> LorenzResult<Self> {
        SimulationConfig::from_signed(
            raw.dt,
            raw.num_steps,
            &raw.integration_method,
            raw.save_interval,
        )
    }
}

impl SimulationConfig {
    pub fn new(
        dt: f64,
        num_steps: usize,
        integration_method: IntegrationMethod,
        save_interval: usize,
    ) -> LorenzResult<Self> {
        let dt = require_positive("dt", dt)?;
        if num_steps == 0 {
            return Err(LorenzError::validation("num_steps", "must be positive (got 0)"));
        }
        if save_interval == 0 {
            return Err(LorenzError::validation(
                "save_interval",
                "must be positive (got 0)",
            ));
        }
        Ok(Self {
            dt,
            num_steps,
            integration_method,
            save_interval,
        })
    }

    /// Builds a config from loosely typed input, e.g. a method name and signed
    /// counts coming from a driver or a config document.
    pub fn from_signed(
        dt: f64,
        num_steps: i64,
        integration_method: &str,
        save_interval: i64,
    ) -> LorenzResult<Self> {
        let dt = require_positive("dt", dt)?;
        let num_steps = positive_count("num_steps", num_steps)?;
        let save_interval = positive_count("save_interval", save_interval)?;
        let method = integration_method.parse()?;
        Self::new(dt, num_steps, method, save_interval)
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn integration_method(&self) -> IntegrationMethod {
        self.integration_method
    }

    pub fn save_interval(&self) -> usize {
        self.save_interval
    }

    pub fn total_time(&self) -> f64 {
        self.dt * self.num_steps as f64
    }

    /// Number of samples a fixed-step run records.
    pub fn expected_samples(&self) -> usize {
        self.num_steps / self.save_interval + 1
    }

    /// Sample timestamps of a fixed-step run.
    pub fn time_array(&self) -> Vec<f64> {
        (0..=self.num_steps)
            .step_by(self.save_interval)
            .map(|k| k as f64 * self.dt)
            .collect()
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            num_steps: 10_000,
            integration_method: IntegrationMethod::Rk4,
            save_interval: 1,
        }
    }
}

fn positive_count(field: &'static str, value: i64) -> LorenzResult<usize> {
    if value <= 0 {
        return Err(LorenzError::validation(
            field,
            format!("must be positive (got {value})"),
        ));
    }
    usize::try_from(value)
        .map_err(|_| LorenzError::validation(field, format!("is too large (got {value})")))
}
