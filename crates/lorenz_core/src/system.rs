use crate::parameters::ParameterSet;
use crate::traits::{DynamicalSystem, Linearizable, Scalar};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point (x, y, z) in the Lorenz phase space.
pub type State = [f64; 3];

/// Matrix of partial derivatives `df_i/dx_j`.
pub type Jacobian = Matrix3<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    #[default]
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// The Lorenz vector field bound to one immutable [`ParameterSet`].
///
/// Changing parameters means building a new system with
/// [`LorenzSystem::with_parameters`]; simulations holding the old value are
/// unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LorenzSystem {
    params: ParameterSet,
}

impl LorenzSystem {
    pub fn new(params: ParameterSet) -> Self {
        Self { params }
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    pub fn with_parameters(&self, params: ParameterSet) -> Self {
        Self::new(params)
    }

    /// (σ(y − x), x(ρ − z) − y, xy − βz)
    pub fn derivative(&self, state: &State) -> State {
        let mut out = [0.0; 3];
        DynamicalSystem::<f64>::apply(self, 0.0, state, &mut out);
        out
    }

    pub fn jacobian(&self, state: &State) -> Jacobian {
        let (sigma, rho, beta) = (self.params.sigma(), self.params.rho(), self.params.beta());
        let [x, y, z] = *state;
        #[rustfmt::skip]
        let jacobian = Matrix3::new(
            -sigma,  sigma, 0.0,
            rho - z, -1.0,  -x,
            y,       x,     -beta,
        );
        jacobian
    }

    /// Fixed points of the flow: the origin, plus C± = (±√(β(ρ−1)), ±√(β(ρ−1)), ρ−1)
    /// once ρ exceeds 1.
    pub fn equilibria(&self) -> Vec<State> {
        let rho = self.params.rho();
        let mut points = vec![[0.0, 0.0, 0.0]];
        if rho > 1.0 {
            let r = (self.params.beta() * (rho - 1.0)).sqrt();
            points.push([r, r, rho - 1.0]);
            points.push([-r, -r, rho - 1.0]);
        }
        points
    }

    /// Points where `trajectory` crosses the plane `state[axis] == plane_offset`,
    /// linearly interpolated between consecutive samples. Crossings in both
    /// directions are reported in trajectory order.
    ///
    /// Samples lying exactly on the plane only count when the signed distance
    /// changes sign across them; the first such sample is the crossing point.
    /// Touching the plane and turning back is not a crossing.
    pub fn poincare_section(trajectory: &[State], plane_offset: f64, axis: Axis) -> Vec<State> {
        let idx = axis.index();
        let mut crossings = Vec::new();
        // Last sample off the plane, and the first on-plane sample after it.
        let mut anchor: Option<(State, f64)> = None;
        let mut on_plane: Option<State> = None;
        for sample in trajectory {
            let d = sample[idx] - plane_offset;
            if !d.is_finite() {
                anchor = None;
                on_plane = None;
                continue;
            }
            if d == 0.0 {
                if anchor.is_some() && on_plane.is_none() {
                    on_plane = Some(*sample);
                }
                continue;
            }
            if let Some((a, da)) = anchor {
                if (da < 0.0) != (d < 0.0) {
                    let point = on_plane.unwrap_or_else(|| {
                        let s = da / (da - d);
                        let mut point = [0.0; 3];
                        for i in 0..3 {
                            point[i] = a[i] + s * (sample[i] - a[i]);
                        }
                        point[idx] = plane_offset;
                        point
                    });
                    crossings.push(point);
                }
            }
            anchor = Some((*sample, d));
            on_plane = None;
        }
        crossings
    }
}

impl<T: Scalar> DynamicalSystem<T> for LorenzSystem {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let sigma = T::from_f64(self.params.sigma()).unwrap_or_else(T::nan);
        let rho = T::from_f64(self.params.rho()).unwrap_or_else(T::nan);
        let beta = T::from_f64(self.params.beta()).unwrap_or_else(T::nan);
        out[0] = sigma * (x[1] - x[0]);
        out[1] = x[0] * (rho - x[2]) - x[1];
        out[2] = x[0] * x[1] - beta * x[2];
    }
}

impl Linearizable for LorenzSystem {
    fn jacobian_into(&self, x: &[f64], out: &mut [f64]) {
        let jacobian = self.jacobian(&[x[0], x[1], x[2]]);
        for i in 0..3 {
            for j in 0..3 {
                out[i * 3 + j] = jacobian[(i, j)];
            }
        }
    }
}

impl fmt::Display for LorenzSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LorenzSystem({})", self.params)
    }
}
