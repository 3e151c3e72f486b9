//! The `lorenz_core` crate is the numerical engine for the Lorenz system
//! `dx/dt = σ(y − x), dy/dt = x(ρ − z) − y, dz/dt = xy − βz`.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `DynamicalSystem` (flows), `Steppable` (solvers).
//! - **Parameters**: validated `ParameterSet`, `InitialConditions`, `SimulationConfig`.
//! - **System**: the vector field, its Jacobian, fixed points and Poincaré sections.
//! - **Solvers**: Euler, RK4, step-doubling RK4 and Dormand-Prince 5(4) with a shared step controller.
//! - **Simulator**: trajectory generation with decimation and divergence detection.
//! - **Analysis**: Lyapunov spectrum via the variational equations and QR re-orthonormalization.
//! - **Sweep**: parameter sweeps and bifurcation diagrams.
pub mod analysis;
pub mod equilibrium;
pub mod error;
pub mod parameters;
pub mod simulator;
pub mod solvers;
pub mod sweep;
pub mod system;
pub mod traits;

pub use analysis::{lyapunov_exponents, LyapunovSettings, LyapunovSpectrum};
pub use error::{LorenzError, LorenzResult};
pub use parameters::{InitialConditions, IntegrationMethod, ParameterSet, SimulationConfig};
pub use simulator::{SimulationMetadata, SimulationResult, Simulator};
pub use solvers::AdaptiveSettings;
pub use system::{Axis, LorenzSystem, State};
