use crate::error::{LorenzError, LorenzResult};
use crate::system::{LorenzSystem, State};
use nalgebra::linalg::SVD;
use nalgebra::{Complex, DMatrix};
use serde::{Deserialize, Serialize};

/// Real parts with magnitude below this are treated as zero.
const HYPERBOLIC_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Unstable,
    Saddle,
    NonHyperbolic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexNumber {
    pub re: f64,
    pub im: f64,
}

impl From<Complex<f64>> for ComplexNumber {
    fn from(value: Complex<f64>) -> Self {
        Self {
            re: value.re,
            im: value.im,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: ComplexNumber,
    pub vector: Vec<ComplexNumber>,
}

/// Local linearization of the flow around a point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linearization {
    pub point: State,
    /// Row-major 3x3 Jacobian.
    pub jacobian: Vec<f64>,
    pub eigenpairs: Vec<EigenPair>,
    pub stability: Stability,
}

pub fn linearize(system: &LorenzSystem, point: &State) -> LorenzResult<Linearization> {
    let jacobian = system.jacobian(point);
    let mut row_major = Vec::with_capacity(9);
    for i in 0..3 {
        for j in 0..3 {
            row_major.push(jacobian[(i, j)]);
        }
    }
    let eigenpairs = compute_eigenpairs(3, &row_major)?;
    let stability = classify(&eigenpairs);
    Ok(Linearization {
        point: *point,
        jacobian: row_major,
        eigenpairs,
        stability,
    })
}

/// Linearizes the flow at each of [`LorenzSystem::equilibria`].
pub fn equilibrium_linearizations(system: &LorenzSystem) -> LorenzResult<Vec<Linearization>> {
    system
        .equilibria()
        .iter()
        .map(|point| linearize(system, point))
        .collect()
}

fn classify(pairs: &[EigenPair]) -> Stability {
    if pairs.iter().any(|p| p.value.re.abs() < HYPERBOLIC_EPS) {
        return Stability::NonHyperbolic;
    }
    let unstable = pairs.iter().filter(|p| p.value.re > 0.0).count();
    match unstable {
        0 => Stability::Stable,
        n if n == pairs.len() => Stability::Unstable,
        _ => Stability::Saddle,
    }
}

fn compute_eigenpairs(dim: usize, jacobian: &[f64]) -> LorenzResult<Vec<EigenPair>> {
    let matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let eigenvalues = matrix.complex_eigenvalues();
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for idx in 0..dim {
        let lambda = eigenvalues[idx];

        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= lambda;
        }

        // The right singular vector of the smallest singular value spans the kernel.
        let svd = SVD::new(shifted, true, true);
        let v_t = svd.v_t.ok_or_else(|| LorenzError::Analysis {
            message: format!("failed to compute eigenvector for eigenvalue index {idx}"),
        })?;
        let smallest = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(dim - 1);
        let mut vector: Vec<Complex<f64>> = v_t.row(smallest).iter().map(|c| c.conj()).collect();
        normalize_complex_vector(&mut vector);

        pairs.push(EigenPair {
            value: ComplexNumber::from(lambda),
            vector: vector.into_iter().map(ComplexNumber::from).collect(),
        });
    }
    Ok(pairs)
}

fn normalize_complex_vector(vec: &mut [Complex<f64>]) {
    let norm = vec.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        for entry in vec {
            *entry /= norm;
        }
    }
}
