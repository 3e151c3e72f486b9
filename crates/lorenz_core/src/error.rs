//! Error types for construction, integration and analysis.

use thiserror::Error;

/// Errors surfaced by the Lorenz engine.
///
/// Divergence of a trajectory is deliberately not represented here: it is an
/// expected numerical outcome and is reported through
/// [`SimulationMetadata::divergent`](crate::simulator::SimulationMetadata).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LorenzError {
    /// Invalid input rejected at construction time.
    #[error("{field} {message}")]
    Validation { field: &'static str, message: String },

    /// An adaptive integrator could not meet its error tolerance.
    #[error("Integration failed at t = {time} (step {step:e}): {message}")]
    Integration {
        time: f64,
        step: f64,
        message: String,
    },

    /// Degenerate linear algebra while analysing the tangent flow.
    #[error("Analysis failed: {message}")]
    Analysis { message: String },
}

pub type LorenzResult<T> = Result<T, LorenzError>;

impl LorenzError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        LorenzError::Validation {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn integration(time: f64, step: f64, message: impl Into<String>) -> Self {
        LorenzError::Integration {
            time,
            step,
            message: message.into(),
        }
    }

    /// Name of the offending field for validation errors.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            LorenzError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Fails with a validation error unless `value` is finite and strictly positive.
pub(crate) fn require_positive(field: &'static str, value: f64) -> LorenzResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(LorenzError::validation(
            field,
            format!("must be positive (got {value})"),
        ))
    }
}
