use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::solver::Toolkit;

/// Stopping rule for the Newton iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewtonConfig {
    /// Converged once the infinity norm of the residual is at or below this
    pub residual_tolerance: f64,
    /// Number of Newton updates allowed before giving up
    pub max_iterations: usize,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        NewtonConfig {
            residual_tolerance: 1e-9,
            max_iterations: 100,
        }
    }
}

/// A square nonlinear system `F(x) = 0` with an analytic Jacobian
pub trait NonlinearSystem {
    fn residual(&self, x: &DVector<f64>) -> Result<DVector<f64>>;

    fn jacobian(&self, x: &DVector<f64>) -> Result<DMatrix<f64>>;
}

/// Result of a converged Newton solve
#[derive(Debug, Clone)]
pub struct NewtonResult {
    pub solution: DVector<f64>,
    /// Number of Newton updates performed
    pub iterations: usize,
    /// Infinity norm of the final residual
    pub residual: f64,
}

/// Solve `F(x) = 0` starting from `x0`.
///
/// Each iteration solves `J(x)·dx = -F(x)` with the toolkit and applies the
/// full update. Returns `NoConvergence` when `max_iterations` updates do not
/// bring the residual within tolerance.
pub fn solve<S: NonlinearSystem + ?Sized>(
    system: &S,
    x0: &DVector<f64>,
    config: &NewtonConfig,
    toolkit: &dyn Toolkit,
) -> Result<NewtonResult> {
    let mut x = x0.clone();

    for iteration in 0..config.max_iterations {
        let f = system.residual(&x)?;
        let residual = f.amax();
        trace!("newton iteration {}: |F| = {:.3e}", iteration, residual);

        if residual <= config.residual_tolerance {
            return Ok(NewtonResult {
                solution: x,
                iterations: iteration,
                residual,
            });
        }

        let jacobian = system.jacobian(&x)?;
        let dx = toolkit.linear_solver(&jacobian, &(-f))?;
        x += dx;
    }

    let residual = system.residual(&x)?.amax();
    if residual <= config.residual_tolerance {
        return Ok(NewtonResult {
            solution: x,
            iterations: config.max_iterations,
            residual,
        });
    }

    debug!(
        "newton failed after {} iterations, residual {:.3e}",
        config.max_iterations, residual
    );
    Err(AnalysisError::NoConvergence {
        iterations: config.max_iterations,
        residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::LinearSolver;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    /// x^2 - a = 0
    struct SquareRoot(f64);

    impl NonlinearSystem for SquareRoot {
        fn residual(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(dvector![x[0] * x[0] - self.0])
        }

        fn jacobian(&self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(dmatrix![2.0 * x[0]])
        }
    }

    /// Linear system A x = b
    struct Linear;

    impl NonlinearSystem for Linear {
        fn residual(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
            Ok(dmatrix![3.0, 1.0; 1.0, 2.0] * x - dvector![9.0, 8.0])
        }

        fn jacobian(&self, _x: &DVector<f64>) -> Result<DMatrix<f64>> {
            Ok(dmatrix![3.0, 1.0; 1.0, 2.0])
        }
    }

    #[test]
    fn test_square_root_converges() {
        let result = solve(&SquareRoot(2.0), &dvector![1.0], &NewtonConfig::default(), &LinearSolver::new()).unwrap();

        assert_relative_eq!(result.solution[0], 2.0_f64.sqrt(), epsilon = 1e-9);
        assert!(result.iterations > 0);
        assert!(result.residual <= 1e-9);
    }

    #[test]
    fn test_linear_system_takes_one_step() {
        let result = solve(&Linear, &dvector![0.0, 0.0], &NewtonConfig::default(), &LinearSolver::new()).unwrap();

        assert_relative_eq!(result.solution[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(result.solution[1], 3.0, epsilon = 1e-12);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_exhausted_budget_is_no_convergence() {
        let config = NewtonConfig {
            residual_tolerance: 1e-15,
            max_iterations: 2,
        };
        let err = solve(&SquareRoot(2.0), &dvector![100.0], &config, &LinearSolver::new()).unwrap_err();

        match err {
            AnalysisError::NoConvergence { iterations, residual } => {
                assert_eq!(iterations, 2);
                assert!(residual > 1.0);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_singular_jacobian_propagates() {
        let err = solve(&SquareRoot(2.0), &dvector![0.0], &NewtonConfig::default(), &LinearSolver::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::SingularMatrix));
    }
}
