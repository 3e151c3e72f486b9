//! Parameter sweeps and bifurcation diagrams built on repeated simulation.

use crate::error::LorenzResult;
use crate::parameters::{InitialConditions, ParameterSet, SimulationConfig};
use crate::simulator::{SimulationResult, Simulator};
use crate::system::{Axis, LorenzSystem, State};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepParameter {
    Sigma,
    Rho,
    Beta,
}

impl SweepParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepParameter::Sigma => "sigma",
            SweepParameter::Rho => "rho",
            SweepParameter::Beta => "beta",
        }
    }

    pub fn value_in(&self, params: &ParameterSet) -> f64 {
        match self {
            SweepParameter::Sigma => params.sigma(),
            SweepParameter::Rho => params.rho(),
            SweepParameter::Beta => params.beta(),
        }
    }

    /// Copy of `base` with this parameter replaced by `value`.
    pub fn apply(&self, base: &ParameterSet, value: f64) -> LorenzResult<ParameterSet> {
        match self {
            SweepParameter::Sigma => base.with_sigma(value),
            SweepParameter::Rho => base.with_rho(value),
            SweepParameter::Beta => base.with_beta(value),
        }
    }
}

impl FromStr for SweepParameter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sigma" => Ok(SweepParameter::Sigma),
            "rho" => Ok(SweepParameter::Rho),
            "beta" => Ok(SweepParameter::Beta),
            other => bail!("Unknown sweep parameter '{other}'; expected sigma, rho or beta"),
        }
    }
}

impl fmt::Display for SweepParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut values: Vec<f64> = (0..n).map(|i| start + i as f64 * step).collect();
            values[n - 1] = end;
            values
        }
    }
}

/// Simulates once per value of `parameter`, in order.
pub fn parameter_sweep(
    simulator: &Simulator,
    base: &ParameterSet,
    parameter: SweepParameter,
    values: &[f64],
    initial_conditions: &InitialConditions,
    config: &SimulationConfig,
) -> Result<Vec<(f64, SimulationResult)>> {
    debug!(%parameter, count = values.len(), "starting parameter sweep");
    let mut results = Vec::with_capacity(values.len());
    for &value in values {
        let result = simulate_at(simulator, base, parameter, value, initial_conditions, config)?;
        if result.metadata.divergent {
            warn!(%parameter, value, "trajectory diverged during sweep");
        }
        results.push((value, result));
    }
    Ok(results)
}

/// Local maxima of one coordinate after the transient, for one parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BifurcationSlice {
    pub parameter_value: f64,
    pub maxima: Vec<f64>,
}

/// Discards the leading `transient_fraction` of each trajectory and collects the
/// local maxima of `axis` over the remainder.
#[allow(clippy::too_many_arguments)]
pub fn bifurcation_diagram(
    simulator: &Simulator,
    base: &ParameterSet,
    parameter: SweepParameter,
    values: &[f64],
    initial_conditions: &InitialConditions,
    config: &SimulationConfig,
    transient_fraction: f64,
    axis: Axis,
) -> Result<Vec<BifurcationSlice>> {
    if !(0.0..1.0).contains(&transient_fraction) {
        bail!("transient_fraction must lie in [0, 1) (got {transient_fraction})");
    }
    debug!(%parameter, count = values.len(), transient_fraction, ?axis, "building bifurcation diagram");

    let mut slices = Vec::with_capacity(values.len());
    for &value in values {
        let result = simulate_at(simulator, base, parameter, value, initial_conditions, config)?;
        let skip = (result.states.len() as f64 * transient_fraction).floor() as usize;
        let maxima = local_maxima(&result.states[skip..], axis);
        slices.push(BifurcationSlice {
            parameter_value: value,
            maxima,
        });
    }
    Ok(slices)
}

fn simulate_at(
    simulator: &Simulator,
    base: &ParameterSet,
    parameter: SweepParameter,
    value: f64,
    initial_conditions: &InitialConditions,
    config: &SimulationConfig,
) -> Result<SimulationResult> {
    let params = parameter
        .apply(base, value)
        .with_context(|| format!("Invalid sweep value {parameter} = {value}"))?;
    let system = LorenzSystem::new(params);
    simulator
        .simulate(&system, initial_conditions, config)
        .with_context(|| format!("Simulation failed at {parameter} = {value}"))
}

/// Values of `axis` at samples strictly above their predecessor and not below
/// their successor. A plateau contributes its first sample.
pub fn local_maxima(trajectory: &[State], axis: Axis) -> Vec<f64> {
    let idx = axis.index();
    trajectory
        .windows(3)
        .filter_map(|w| {
            let (prev, cur, next) = (w[0][idx], w[1][idx], w[2][idx]);
            (prev < cur && cur >= next).then_some(cur)
        })
        .collect()
}
