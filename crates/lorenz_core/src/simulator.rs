use crate::error::LorenzResult;
use crate::parameters::{InitialConditions, IntegrationMethod, SimulationConfig};
use crate::solvers::{AdaptiveSettings, Integrator};
use crate::system::{Axis, LorenzSystem, State};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default cap on accepted adaptive steps per run.
pub const DEFAULT_MAX_ACCEPTED_STEPS: usize = 5_000_000;

/// Relative slack when deciding that an adaptive run reached its horizon.
const HORIZON_EPS: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationMetadata {
    pub method: IntegrationMethod,
    #[serde(serialize_with = "serialize_seconds")]
    pub elapsed_wall_time: Duration,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// Set when a non-finite state stopped the run early.
    pub divergent: bool,
    pub final_time: f64,
    pub dt: f64,
    pub save_interval: usize,
}

fn serialize_seconds<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(value.as_secs_f64())
}

/// Sampled trajectory plus run metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub states: Vec<State>,
    pub times: Vec<f64>,
    pub metadata: SimulationMetadata,
}

impl SimulationResult {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn final_state(&self) -> Option<&State> {
        self.states.last()
    }

    /// One coordinate of every sample, e.g. for plotting.
    pub fn component(&self, axis: Axis) -> Vec<f64> {
        let idx = axis.index();
        self.states.iter().map(|s| s[idx]).collect()
    }

    pub fn poincare_section(&self, plane_offset: f64, axis: Axis) -> Vec<State> {
        LorenzSystem::poincare_section(&self.states, plane_offset, axis)
    }
}

/// Runs the configured integrator over a [`LorenzSystem`].
///
/// Each call owns its trajectory buffer and integrator scratch space, so one
/// `Simulator` can serve any number of sequential runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Simulator {
    adaptive: AdaptiveSettings,
    max_accepted_steps: usize,
}

impl Default for Simulator {
    fn default() -> Self {
        Self {
            adaptive: AdaptiveSettings::default(),
            max_accepted_steps: DEFAULT_MAX_ACCEPTED_STEPS,
        }
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adaptive_settings(mut self, settings: AdaptiveSettings) -> LorenzResult<Self> {
        settings.validate()?;
        self.adaptive = settings;
        Ok(self)
    }

    /// Caps the number of accepted adaptive steps; values below 1 are raised to 1.
    pub fn with_max_accepted_steps(mut self, cap: usize) -> Self {
        self.max_accepted_steps = cap.max(1);
        self
    }

    pub fn adaptive_settings(&self) -> &AdaptiveSettings {
        &self.adaptive
    }

    pub fn simulate(
        &self,
        system: &LorenzSystem,
        initial_conditions: &InitialConditions,
        config: &SimulationConfig,
    ) -> LorenzResult<SimulationResult> {
        let method = config.integration_method();
        debug!(
            %method,
            dt = config.dt(),
            num_steps = config.num_steps(),
            save_interval = config.save_interval(),
            params = %system.parameters(),
            "starting simulation"
        );
        let started = Instant::now();
        let mut integrator = Integrator::new(method, 3, self.adaptive);
        let run = if method.is_adaptive() {
            self.run_adaptive(&mut integrator, system, initial_conditions, config)?
        } else {
            run_fixed(&mut integrator, system, initial_conditions, config)?
        };
        let elapsed = started.elapsed();
        debug!(
            %method,
            samples = run.states.len(),
            accepted = run.accepted,
            rejected = run.rejected,
            divergent = run.divergent,
            elapsed_ms = elapsed.as_secs_f64() * 1e3,
            "simulation finished"
        );
        Ok(SimulationResult {
            states: run.states,
            times: run.times,
            metadata: SimulationMetadata {
                method,
                elapsed_wall_time: elapsed,
                accepted_steps: run.accepted,
                rejected_steps: run.rejected,
                divergent: run.divergent,
                final_time: run.final_time,
                dt: config.dt(),
                save_interval: config.save_interval(),
            },
        })
    }

    fn run_adaptive(
        &self,
        integrator: &mut Integrator,
        system: &LorenzSystem,
        initial_conditions: &InitialConditions,
        config: &SimulationConfig,
    ) -> LorenzResult<Run> {
        let total_time = config.total_time();
        let save_interval = config.save_interval();
        let mut run = Run::new(Vec::new(), Vec::new());
        let mut state = initial_conditions.to_array();
        let mut t = 0.0;
        let mut dt = config.dt();
        run.record(t, state);

        while total_time - t > HORIZON_EPS * total_time {
            if run.accepted >= self.max_accepted_steps {
                warn!(
                    cap = self.max_accepted_steps,
                    t, total_time, "accepted-step cap reached before the horizon"
                );
                break;
            }
            let trial = dt.min(total_time - t);
            let report = integrator.advance(system, &mut t, &mut state, trial)?;
            run.accepted += 1;
            run.rejected += report.rejected;
            if !is_finite(&state) {
                run.mark_divergent(t);
                break;
            }
            dt = report.next_dt;
            if run.accepted % save_interval == 0 {
                run.record(t, state);
            }
        }

        if !run.divergent && run.accepted % save_interval != 0 {
            run.record(t, state);
        }
        run.final_time = t;
        Ok(run)
    }
}

fn run_fixed(
    integrator: &mut Integrator,
    system: &LorenzSystem,
    initial_conditions: &InitialConditions,
    config: &SimulationConfig,
) -> LorenzResult<Run> {
    let samples = config.expected_samples();
    let save_interval = config.save_interval();
    let dt = config.dt();
    let mut run = Run::new(Vec::with_capacity(samples), Vec::with_capacity(samples));
    let mut state = initial_conditions.to_array();
    let mut t = 0.0;
    run.record(t, state);

    for step in 1..=config.num_steps() {
        integrator.advance(system, &mut t, &mut state, dt)?;
        run.accepted += 1;
        // Timestamps come from the step index so they do not accumulate rounding.
        t = step as f64 * dt;
        if !is_finite(&state) {
            run.mark_divergent(t);
            break;
        }
        if step % save_interval == 0 {
            run.record(t, state);
        }
    }
    run.final_time = t;
    Ok(run)
}

struct Run {
    states: Vec<State>,
    times: Vec<f64>,
    accepted: usize,
    rejected: usize,
    divergent: bool,
    final_time: f64,
}

impl Run {
    fn new(states: Vec<State>, times: Vec<f64>) -> Self {
        Self {
            states,
            times,
            accepted: 0,
            rejected: 0,
            divergent: false,
            final_time: 0.0,
        }
    }

    fn record(&mut self, t: f64, state: State) {
        self.states.push(state);
        self.times.push(t);
    }

    fn mark_divergent(&mut self, t: f64) {
        warn!(t, step = self.accepted, "non-finite state, stopping early");
        self.divergent = true;
    }
}

fn is_finite(state: &State) -> bool {
    state.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::Simulator;
    use crate::error::LorenzError;
    use crate::parameters::{InitialConditions, IntegrationMethod, ParameterSet, SimulationConfig};
    use crate::solvers::AdaptiveSettings;
    use crate::system::{Axis, LorenzSystem};

    fn classical() -> LorenzSystem {
        LorenzSystem::new(ParameterSet::classical())
    }

    fn config(method: IntegrationMethod, dt: f64, steps: usize, save: usize) -> SimulationConfig {
        SimulationConfig::new(dt, steps, method, save).expect("valid config")
    }

    #[test]
    fn fixed_step_run_records_every_sample() {
        let ic = InitialConditions::new(0.0, 1.0, 1.05);
        for method in [IntegrationMethod::Euler, IntegrationMethod::Rk4] {
            let result = Simulator::new()
                .simulate(&classical(), &ic, &config(method, 0.01, 1000, 1))
                .expect("simulation should succeed");
            assert_eq!(result.len(), 1001);
            assert_eq!(result.times.len(), 1001);
            assert_eq!(result.states[0], ic.to_array());
            assert_eq!(result.times[0], 0.0);
            assert!((result.times[1000] - 10.0).abs() < 1e-12);
            assert_eq!(result.metadata.accepted_steps, 1000);
            assert_eq!(result.metadata.rejected_steps, 0);
            assert!(!result.metadata.divergent);
            assert_eq!(result.metadata.method, method);
        }
    }

    #[test]
    fn save_interval_thins_fixed_step_output() {
        let cfg = config(IntegrationMethod::Rk4, 0.01, 1000, 7);
        let result = Simulator::new()
            .simulate(&classical(), &InitialConditions::default(), &cfg)
            .expect("simulation should succeed");
        assert_eq!(result.len(), cfg.expected_samples());
        assert_eq!(result.len(), 1000 / 7 + 1);
        for (actual, expected) in result.times.iter().zip(cfg.time_array()) {
            assert!((actual - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn identical_inputs_give_identical_trajectories() {
        let ic = InitialConditions::random(1.0, 42).expect("valid scale");
        for method in IntegrationMethod::ALL {
            let cfg = config(method, 0.01, 500, 1);
            let a = Simulator::new().simulate(&classical(), &ic, &cfg).expect("run a");
            let b = Simulator::new().simulate(&classical(), &ic, &cfg).expect("run b");
            assert_eq!(a.states, b.states);
            assert_eq!(a.times, b.times);
        }
    }

    #[test]
    fn adaptive_runs_reach_the_horizon() {
        let ic = InitialConditions::default();
        for method in [IntegrationMethod::Adaptive, IntegrationMethod::DormandPrince54] {
            let cfg = config(method, 0.01, 500, 1);
            let result = Simulator::new()
                .simulate(&classical(), &ic, &cfg)
                .expect("adaptive run should succeed");
            assert_eq!(result.states[0], ic.to_array());
            let last = *result.times.last().expect("non-empty");
            assert!((last - 5.0).abs() < 1e-9, "final time {last}");
            assert!((result.metadata.final_time - 5.0).abs() < 1e-9);
            assert_eq!(result.len(), result.metadata.accepted_steps + 1);
            assert!(result.times.windows(2).all(|w| w[1] > w[0]));
        }
    }

    #[test]
    fn adaptive_run_agrees_with_fine_rk4() {
        let ic = InitialConditions::default();
        let simulator = Simulator::new()
            .with_adaptive_settings(AdaptiveSettings {
                tolerance: 1e-9,
                ..AdaptiveSettings::default()
            })
            .expect("valid settings");
        let adaptive = simulator
            .simulate(&classical(), &ic, &config(IntegrationMethod::DormandPrince54, 0.01, 100, 1))
            .expect("adaptive run");
        let reference = simulator
            .simulate(&classical(), &ic, &config(IntegrationMethod::Rk4, 1e-4, 10_000, 10_000))
            .expect("reference run");
        let a = adaptive.final_state().expect("non-empty");
        let r = reference.final_state().expect("non-empty");
        for i in 0..3 {
            assert!((a[i] - r[i]).abs() < 1e-5, "component {i}: {} vs {}", a[i], r[i]);
        }
    }

    #[test]
    fn adaptive_save_interval_keeps_final_sample() {
        let cfg = config(IntegrationMethod::DormandPrince54, 0.01, 300, 4);
        let result = Simulator::new()
            .simulate(&classical(), &InitialConditions::default(), &cfg)
            .expect("adaptive run");
        let last = *result.times.last().expect("non-empty");
        assert!((last - 3.0).abs() < 1e-9);
        let accepted = result.metadata.accepted_steps;
        let expected = 1 + accepted / 4 + usize::from(accepted % 4 != 0);
        assert_eq!(result.len(), expected);
    }

    #[test]
    fn accepted_step_cap_stops_adaptive_runs() {
        let cfg = config(IntegrationMethod::Adaptive, 0.01, 1000, 1);
        let result = Simulator::new()
            .with_max_accepted_steps(10)
            .simulate(&classical(), &InitialConditions::default(), &cfg)
            .expect("capped run");
        assert_eq!(result.metadata.accepted_steps, 10);
        assert_eq!(result.len(), 11);
        assert!(result.metadata.final_time < 10.0);
        assert!(!result.metadata.divergent);
    }

    #[test]
    fn euler_blow_up_is_reported_as_divergence() {
        let ic = InitialConditions::new(1.0, 1.0, 1.0);
        let result = Simulator::new()
            .simulate(&classical(), &ic, &config(IntegrationMethod::Euler, 0.5, 1000, 1))
            .expect("divergence is not an error");
        assert!(result.metadata.divergent);
        assert!(result.len() < 1001);
        assert!(result
            .states
            .iter()
            .all(|s| s.iter().all(|v| v.is_finite())));
        assert_eq!(result.states.len(), result.times.len());
    }

    #[test]
    fn overflow_is_divergence_for_every_method() {
        let ic = InitialConditions::new(1e155, 1e155, 1e155);
        for method in IntegrationMethod::ALL {
            let result = Simulator::new()
                .simulate(&classical(), &ic, &config(method, 0.01, 10, 1))
                .unwrap_or_else(|err| panic!("{method}: divergence is not an error: {err}"));
            assert!(result.metadata.divergent, "{method}");
            assert_eq!(result.len(), 1, "{method}");
            assert_eq!(result.states[0], ic.to_array());
        }
    }

    #[test]
    fn adaptive_runs_finish_when_remainder_is_below_step_floor() {
        let simulator = Simulator::new()
            .with_adaptive_settings(AdaptiveSettings {
                min_step: 1e-3,
                ..AdaptiveSettings::default()
            })
            .expect("valid settings");
        let ic = InitialConditions::default();
        for method in [IntegrationMethod::Adaptive, IntegrationMethod::DormandPrince54] {
            for num_steps in 50..150 {
                let cfg = config(method, 0.01, num_steps, 1);
                let result = simulator
                    .simulate(&classical(), &ic, &cfg)
                    .unwrap_or_else(|err| panic!("{method} n={num_steps}: {err}"));
                assert!(
                    (result.metadata.final_time - cfg.total_time()).abs() < 1e-9,
                    "{method} n={num_steps}: stopped at {}",
                    result.metadata.final_time
                );
                assert!(!result.metadata.divergent);
            }
        }
    }

    #[test]
    fn adaptive_failure_propagates_as_integration_error() {
        let simulator = Simulator::new()
            .with_adaptive_settings(AdaptiveSettings {
                tolerance: 1e-14,
                min_step: 1e-3,
                ..AdaptiveSettings::default()
            })
            .expect("valid settings");
        let err = simulator
            .simulate(
                &classical(),
                &InitialConditions::new(5.0, 5.0, 20.0),
                &config(IntegrationMethod::Adaptive, 0.1, 100, 1),
            )
            .expect_err("tolerance is unreachable above the floor");
        assert!(matches!(err, LorenzError::Integration { .. }));
    }

    #[test]
    fn invalid_adaptive_settings_are_rejected() {
        let err = Simulator::new()
            .with_adaptive_settings(AdaptiveSettings {
                max_factor: 0.5,
                ..AdaptiveSettings::default()
            })
            .expect_err("max_factor below one");
        assert_eq!(err.field(), Some("max_factor"));
    }

    #[test]
    fn result_helpers_expose_components_and_sections() {
        let result = Simulator::new()
            .simulate(
                &classical(),
                &InitialConditions::new(0.0, 1.0, 1.05),
                &config(IntegrationMethod::Rk4, 0.01, 5000, 1),
            )
            .expect("simulation should succeed");
        let z = result.component(Axis::Z);
        assert_eq!(z.len(), result.len());
        assert_eq!(z[0], 1.05);
        let section = result.poincare_section(27.0, Axis::Z);
        assert!(!section.is_empty());
        assert!(section.iter().all(|p| (p[2] - 27.0).abs() < 1e-9));
    }

    #[test]
    fn result_serializes_with_wall_time_in_seconds() {
        let result = Simulator::new()
            .simulate(
                &classical(),
                &InitialConditions::default(),
                &config(IntegrationMethod::Rk4, 0.01, 10, 5),
            )
            .expect("simulation should succeed");
        let value = serde_json::to_value(&result).expect("serializable");
        assert_eq!(value["metadata"]["method"], "rk4");
        assert!(value["metadata"]["elapsed_wall_time"].is_f64());
        assert_eq!(value["states"].as_array().map(|s| s.len()), Some(3));
    }
}
