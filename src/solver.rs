use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use nalgebra::linalg::{LU, QR};
use nalgebra::{ComplexField, DMatrix, DVector, Dyn};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::circuit::EvalParams;
use crate::error::{AnalysisError, Result};

/// Solver configuration
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub method: SolverMethod,
    /// Relative residual target of iterative methods
    pub tolerance: f64,
    pub max_iterations: usize,
    /// A pivot at or below `pivot_tolerance` times the largest entry of its
    /// own row or column in the triangular factor marks the matrix singular
    pub pivot_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            method: SolverMethod::Lu,
            tolerance: 1e-12,
            max_iterations: 1000,
            pivot_tolerance: 1e-14,
        }
    }
}

/// Available solver methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverMethod {
    /// Direct LU decomposition
    Lu,
    /// QR decomposition
    Qr,
    /// BiCGSTAB (for general sparse matrices)
    BiCgStab,
}

/// Linear-algebra backend used by every analysis.
///
/// Implementations must be usable behind `Arc<dyn Toolkit>`; analyses never
/// pick a backend on their own.
pub trait Toolkit: Send + Sync {
    fn name(&self) -> &'static str;

    /// Solve `A x = b` over the reals
    fn linear_solver(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>>;

    /// Solve `A x = b` over the complex numbers
    fn linear_solver_complex(&self, a: &DMatrix<Complex64>, b: &DVector<Complex64>) -> Result<DVector<Complex64>>;

    /// Prepare `A` once so it can be solved against many right-hand sides
    fn to_matrix(&self, a: &DMatrix<Complex64>) -> Result<Box<dyn PreparedSystem>>;

    /// Hook run once when an analysis is constructed
    fn setup_analysis(&self, _params: &mut EvalParams) {}
}

/// A coefficient matrix prepared by a [`Toolkit`]
pub trait PreparedSystem {
    fn dim(&self) -> usize;

    fn solve(&self, b: &DVector<Complex64>) -> Result<DVector<Complex64>>;
}

/// Which backend to build, as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolkitKind {
    #[default]
    Dense,
    Sparse,
}

impl ToolkitKind {
    pub fn build(self) -> Arc<dyn Toolkit> {
        match self {
            ToolkitKind::Dense => Arc::new(LinearSolver::new()),
            ToolkitKind::Sparse => Arc::new(SparseSolver::new()),
        }
    }
}

impl fmt::Display for ToolkitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolkitKind::Dense => write!(f, "dense"),
            ToolkitKind::Sparse => write!(f, "sparse"),
        }
    }
}

impl FromStr for ToolkitKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dense" => Ok(ToolkitKind::Dense),
            "sparse" => Ok(ToolkitKind::Sparse),
            other => Err(AnalysisError::configuration(format!("unknown toolkit '{}'", other))),
        }
    }
}

/// Dense nalgebra backend (LU or QR)
pub struct LinearSolver {
    config: SolverConfig,
}

impl LinearSolver {
    /// Create a new solver with default configuration
    pub fn new() -> Self {
        LinearSolver {
            config: SolverConfig::default(),
        }
    }

    /// Create a new solver with custom configuration
    pub fn with_config(config: SolverConfig) -> Self {
        LinearSolver { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

impl Default for LinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Toolkit for LinearSolver {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn linear_solver(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let start_time = Instant::now();
        let factor = DenseFactor::new(a, &self.config)?;
        let x = factor.solve(b)?;
        trace!("dense {:?} solve of size {} in {:?}", self.config.method, a.nrows(), start_time.elapsed());
        Ok(x)
    }

    fn linear_solver_complex(&self, a: &DMatrix<Complex64>, b: &DVector<Complex64>) -> Result<DVector<Complex64>> {
        DenseFactor::new(a, &self.config)?.solve(b)
    }

    fn to_matrix(&self, a: &DMatrix<Complex64>) -> Result<Box<dyn PreparedSystem>> {
        Ok(Box::new(DenseFactor::new(a, &self.config)?))
    }
}

/// A factorised dense matrix
enum DenseFactor<T: ComplexField<RealField = f64>> {
    Lu(LU<T, Dyn, Dyn>),
    Qr(QR<T, Dyn, Dyn>),
}

impl<T: ComplexField<RealField = f64>> DenseFactor<T> {
    fn new(matrix: &DMatrix<T>, config: &SolverConfig) -> Result<Self> {
        if matrix.nrows() != matrix.ncols() {
            return Err(AnalysisError::DimensionMismatch {
                expected: matrix.nrows(),
                actual: matrix.ncols(),
            });
        }

        if !max_modulus(matrix.iter()).is_finite() {
            return Err(AnalysisError::SingularMatrix);
        }
        let tolerance = config.pivot_tolerance;

        match config.method {
            SolverMethod::Qr => {
                let qr = matrix.clone().qr();
                check_pivots(&qr.r(), tolerance)?;
                Ok(DenseFactor::Qr(qr))
            }
            // Iterative methods only apply to sparse storage
            SolverMethod::Lu | SolverMethod::BiCgStab => {
                let lu = matrix.clone().lu();
                check_pivots(&lu.u(), tolerance)?;
                Ok(DenseFactor::Lu(lu))
            }
        }
    }

    fn dim(&self) -> usize {
        match self {
            DenseFactor::Lu(lu) => lu.l().nrows(),
            DenseFactor::Qr(qr) => qr.r().nrows(),
        }
    }

    fn solve(&self, rhs: &DVector<T>) -> Result<DVector<T>> {
        let dim = self.dim();
        if rhs.len() != dim {
            return Err(AnalysisError::DimensionMismatch {
                expected: dim,
                actual: rhs.len(),
            });
        }

        let solution = match self {
            DenseFactor::Lu(lu) => lu.solve(rhs),
            DenseFactor::Qr(qr) => qr.solve(rhs),
        }
        .ok_or(AnalysisError::SingularMatrix)?;

        check_finite(&solution)?;
        Ok(solution)
    }
}

impl PreparedSystem for DenseFactor<Complex64> {
    fn dim(&self) -> usize {
        DenseFactor::dim(self)
    }

    fn solve(&self, b: &DVector<Complex64>) -> Result<DVector<Complex64>> {
        DenseFactor::solve(self, b)
    }
}

/// Sparse sprs backend.
///
/// Matrices are stored in CSR form. `Lu` factorises through a dense
/// conversion; `BiCgStab` iterates on the sparse matrix directly.
pub struct SparseSolver {
    config: SolverConfig,
}

impl SparseSolver {
    pub fn new() -> Self {
        SparseSolver {
            config: SolverConfig::default(),
        }
    }

    /// Sparse backend iterating with BiCGSTAB instead of factorising
    pub fn iterative() -> Self {
        SparseSolver {
            config: SolverConfig {
                method: SolverMethod::BiCgStab,
                ..SolverConfig::default()
            },
        }
    }

    pub fn with_config(config: SolverConfig) -> Self {
        SparseSolver { config }
    }

    fn prepare(&self, a: &DMatrix<Complex64>) -> Result<SparseSystem> {
        let sparse = to_sparse(a)?;
        debug!(
            "sparse matrix {}x{} with {} non-zeros",
            sparse.rows(),
            sparse.cols(),
            sparse.nnz()
        );

        match self.config.method {
            SolverMethod::BiCgStab => Ok(SparseSystem::Iterative {
                matrix: sparse,
                tolerance: self.config.tolerance,
                max_iterations: self.config.max_iterations,
            }),
            _ => Ok(SparseSystem::Direct(DenseFactor::new(
                &sparse_to_dense(&sparse),
                &self.config,
            )?)),
        }
    }
}

impl Default for SparseSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Toolkit for SparseSolver {
    fn name(&self) -> &'static str {
        "sparse"
    }

    fn linear_solver(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let a = a.map(|v| Complex64::new(v, 0.0));
        let b = b.map(|v| Complex64::new(v, 0.0));
        let x = self.linear_solver_complex(&a, &b)?;
        Ok(x.map(|v| v.re))
    }

    fn linear_solver_complex(&self, a: &DMatrix<Complex64>, b: &DVector<Complex64>) -> Result<DVector<Complex64>> {
        self.prepare(a)?.solve(b)
    }

    fn to_matrix(&self, a: &DMatrix<Complex64>) -> Result<Box<dyn PreparedSystem>> {
        Ok(Box::new(self.prepare(a)?))
    }
}

enum SparseSystem {
    Direct(DenseFactor<Complex64>),
    Iterative {
        matrix: CsMat<Complex64>,
        tolerance: f64,
        max_iterations: usize,
    },
}

impl PreparedSystem for SparseSystem {
    fn dim(&self) -> usize {
        match self {
            SparseSystem::Direct(factor) => factor.dim(),
            SparseSystem::Iterative { matrix, .. } => matrix.rows(),
        }
    }

    fn solve(&self, b: &DVector<Complex64>) -> Result<DVector<Complex64>> {
        match self {
            SparseSystem::Direct(factor) => factor.solve(b),
            SparseSystem::Iterative {
                matrix,
                tolerance,
                max_iterations,
            } => {
                if b.len() != matrix.rows() {
                    return Err(AnalysisError::DimensionMismatch {
                        expected: matrix.rows(),
                        actual: b.len(),
                    });
                }
                let x = solve_bicgstab(matrix, b.as_slice(), *tolerance, *max_iterations)?;
                let x = DVector::from_vec(x);
                check_finite(&x)?;
                Ok(x)
            }
        }
    }
}

/// BiCGSTAB iterative solver for sparse complex matrices
fn solve_bicgstab(
    matrix: &CsMat<Complex64>,
    rhs: &[Complex64],
    tolerance: f64,
    max_iterations: usize,
) -> Result<Vec<Complex64>> {
    let n = matrix.rows();
    let zero = Complex64::new(0.0, 0.0);
    let one = Complex64::new(1.0, 0.0);
    let mut x = vec![zero; n];

    let rhs_norm = vector_norm(rhs);
    if rhs_norm == 0.0 {
        return Ok(x);
    }
    let target = tolerance * rhs_norm;

    // x = 0, so the initial residual is b
    let mut r = rhs.to_vec();
    let r_hat = r.clone();
    let mut p = vec![zero; n];
    let mut v = vec![zero; n];

    let mut rho = one;
    let mut alpha = one;
    let mut omega = one;
    let mut residual_norm = rhs_norm;

    for iteration in 0..max_iterations {
        if residual_norm <= target {
            trace!("BiCGSTAB converged after {} iterations", iteration);
            return Ok(x);
        }

        let rho_new = vector_dot(&r_hat, &r);
        if rho_new.norm() < f64::MIN_POSITIVE {
            break;
        }

        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;

        // p = r + beta * (p - omega * v)
        for i in 0..n {
            p[i] = r[i] + beta * (p[i] - omega * v[i]);
        }

        v = sparse_matrix_vector_multiply(matrix, &p);
        let r_hat_v = vector_dot(&r_hat, &v);
        if r_hat_v.norm() < f64::MIN_POSITIVE {
            break;
        }
        alpha = rho / r_hat_v;

        // s = r - alpha * v
        let s: Vec<Complex64> = r.iter().zip(&v).map(|(ri, vi)| ri - alpha * vi).collect();
        if vector_norm(&s) <= target {
            for i in 0..n {
                x[i] += alpha * p[i];
            }
            return Ok(x);
        }

        let t = sparse_matrix_vector_multiply(matrix, &s);
        let tt = vector_dot(&t, &t);
        if tt.norm() < f64::MIN_POSITIVE {
            break;
        }
        omega = vector_dot(&t, &s) / tt;

        for i in 0..n {
            x[i] += alpha * p[i] + omega * s[i];
            r[i] = s[i] - omega * t[i];
        }

        residual_norm = vector_norm(&r);

        if omega.norm() < f64::MIN_POSITIVE {
            break;
        }
    }

    if residual_norm <= target {
        return Ok(x);
    }
    Err(AnalysisError::NoConvergence {
        iterations: max_iterations,
        residual: residual_norm / rhs_norm,
    })
}

// Helper functions

/// Convert a dense matrix to CSR, dropping exact zeros
fn to_sparse(matrix: &DMatrix<Complex64>) -> Result<CsMat<Complex64>> {
    if matrix.nrows() != matrix.ncols() {
        return Err(AnalysisError::DimensionMismatch {
            expected: matrix.nrows(),
            actual: matrix.ncols(),
        });
    }

    let mut triplet_mat = TriMat::new((matrix.nrows(), matrix.ncols()));
    for col in 0..matrix.ncols() {
        for row in 0..matrix.nrows() {
            let value = matrix[(row, col)];
            if value.re != 0.0 || value.im != 0.0 {
                triplet_mat.add_triplet(row, col, value);
            }
        }
    }
    Ok(triplet_mat.to_csr())
}

/// Convert sparse matrix to dense matrix
fn sparse_to_dense(sparse: &CsMat<Complex64>) -> DMatrix<Complex64> {
    let mut dense = DMatrix::zeros(sparse.rows(), sparse.cols());

    for (value, (row, col)) in sparse.iter() {
        dense[(row, col)] = *value;
    }

    dense
}

/// Sparse matrix-vector multiplication
fn sparse_matrix_vector_multiply(matrix: &CsMat<Complex64>, vector: &[Complex64]) -> Vec<Complex64> {
    let mut result = vec![Complex64::new(0.0, 0.0); matrix.rows()];

    for (value, (row, col)) in matrix.iter() {
        result[row] += value * vector[col];
    }

    result
}

/// Hermitian inner product `sum(conj(a_i) * b_i)`
fn vector_dot(a: &[Complex64], b: &[Complex64]) -> Complex64 {
    a.iter().zip(b.iter()).map(|(x, y)| x.conj() * y).sum()
}

/// Vector L2 norm
fn vector_norm(vector: &[Complex64]) -> f64 {
    vector.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt()
}

fn max_modulus<'a, T: ComplexField<RealField = f64>>(values: impl Iterator<Item = &'a T>) -> f64 {
    values.fold(0.0, |acc, v| {
        let m = v.clone().modulus();
        if m.is_nan() {
            f64::NAN
        } else {
            acc.max(m)
        }
    })
}

/// Each pivot is judged against its own row and column of the triangular
/// factor, so rows of very different magnitude do not mask each other.
fn check_pivots<T: ComplexField<RealField = f64>>(triangular: &DMatrix<T>, tolerance: f64) -> Result<()> {
    let n = triangular.nrows().min(triangular.ncols());
    for i in 0..n {
        let pivot = triangular[(i, i)].clone().modulus();
        let row = max_modulus(triangular.row(i).iter().skip(i));
        let column = max_modulus(triangular.column(i).iter().take(i + 1));
        let threshold = tolerance * row.max(column);
        if pivot <= threshold {
            debug!("pivot {} = {:.3e} below {:.3e}", i, pivot, threshold);
            return Err(AnalysisError::SingularMatrix);
        }
    }
    Ok(())
}

fn check_finite<T: ComplexField<RealField = f64>>(solution: &DVector<T>) -> Result<()> {
    if solution.iter().all(|v| v.clone().modulus().is_finite()) {
        Ok(())
    } else {
        Err(AnalysisError::SingularMatrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn test_dense_lu_solver() {
        let solver = LinearSolver::new();

        // [2 1; 1 2] * [x; y] = [3; 3] has solution [1; 1]
        let matrix = dmatrix![2.0, 1.0; 1.0, 2.0];
        let rhs = dvector![3.0, 3.0];

        let solution = solver.linear_solver(&matrix, &rhs).unwrap();

        assert_relative_eq!(solution[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(solution[1], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_dense_qr_solver() {
        let solver = LinearSolver::with_config(SolverConfig {
            method: SolverMethod::Qr,
            ..SolverConfig::default()
        });
        let matrix = dmatrix![4.0, -2.0; 1.0, 1.0];
        let rhs = dvector![2.0, 3.0];

        let solution = solver.linear_solver(&matrix, &rhs).unwrap();

        assert_relative_eq!(solution[0], 4.0 / 3.0, epsilon = 1e-10);
        assert_relative_eq!(solution[1], 5.0 / 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_singular_matrix_detected() {
        let singular = dmatrix![1.0, 2.0; 2.0, 4.0];
        let rhs = dvector![1.0, 1.0];

        let toolkits: Vec<Box<dyn Toolkit>> = vec![
            Box::new(LinearSolver::new()),
            Box::new(SparseSolver::new()),
            Box::new(SparseSolver::iterative()),
        ];
        for toolkit in toolkits {
            let err = toolkit.linear_solver(&singular, &rhs).unwrap_err();
            assert!(err.is_numerical(), "{} returned {:?}", toolkit.name(), err);
        }

        let zero_row = dmatrix![1.0, 0.0; 0.0, 0.0];
        assert!(matches!(
            LinearSolver::new().linear_solver(&zero_row, &rhs),
            Err(AnalysisError::SingularMatrix)
        ));
    }

    #[test]
    fn test_widely_scaled_diagonal_is_regular() {
        // 1 mOhm next to 1 TOhm: fifteen decades apart, perfectly conditioned
        let matrix = dmatrix![1e3, 0.0; 0.0, 1e-12];
        let rhs = dvector![1.0, 1e-12];

        for method in [SolverMethod::Lu, SolverMethod::Qr] {
            let solver = LinearSolver::with_config(SolverConfig {
                method,
                ..SolverConfig::default()
            });
            let x = solver.linear_solver(&matrix, &rhs).unwrap();
            assert_relative_eq!(x[0], 1e-3, max_relative = 1e-12);
            assert_relative_eq!(x[1], 1.0, max_relative = 1e-12);
        }
        let x = SparseSolver::new().linear_solver(&matrix, &rhs).unwrap();
        assert_relative_eq!(x[1], 1.0, max_relative = 1e-12);

        // Dependent rows stay singular whatever their scale
        let scaled_singular = dmatrix![1e-12, -1e-12; -1e-12, 1e-12];
        assert!(matches!(
            LinearSolver::new().linear_solver(&scaled_singular, &rhs),
            Err(AnalysisError::SingularMatrix)
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let solver = LinearSolver::new();
        let matrix = DMatrix::<f64>::identity(3, 3);
        assert!(matches!(
            solver.linear_solver(&matrix, &dvector![1.0, 2.0]),
            Err(AnalysisError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_complex_solve() {
        // (1 + j) x = 2 -> x = 1 - j
        let a = DMatrix::from_element(1, 1, c(1.0, 1.0));
        let b = DVector::from_element(1, c(2.0, 0.0));
        let x = LinearSolver::new().linear_solver_complex(&a, &b).unwrap();

        assert_relative_eq!(x[0].re, 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[0].im, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sparse_agrees_with_dense() {
        let a = dmatrix![
            c(4.0, 1.0), c(-1.0, 0.0), c(0.0, 0.0), c(0.0, 0.0);
            c(-1.0, 0.0), c(4.0, 0.5), c(-1.0, 0.0), c(0.0, 0.0);
            c(0.0, 0.0), c(-1.0, 0.0), c(4.0, 0.0), c(-1.0, 0.0);
            c(0.0, 0.0), c(0.0, 0.0), c(-1.0, 0.0), c(3.0, -0.2)
        ];
        let b = dvector![c(1.0, 0.0), c(0.0, 2.0), c(-1.0, 0.0), c(0.5, 0.5)];

        let dense = LinearSolver::new().linear_solver_complex(&a, &b).unwrap();
        let iterative = SparseSolver::iterative().linear_solver_complex(&a, &b).unwrap();
        let direct = SparseSolver::new().linear_solver_complex(&a, &b).unwrap();

        for i in 0..4 {
            assert_relative_eq!(dense[i].re, iterative[i].re, epsilon = 1e-9);
            assert_relative_eq!(dense[i].im, iterative[i].im, epsilon = 1e-9);
            assert_relative_eq!(dense[i].re, direct[i].re, epsilon = 1e-12);
            assert_relative_eq!(dense[i].im, direct[i].im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_prepared_system_reused() {
        let a = dmatrix![c(2.0, 0.0), c(1.0, 0.0); c(1.0, 0.0), c(3.0, 0.0)];
        let toolkits: Vec<Arc<dyn Toolkit>> = vec![
            ToolkitKind::Dense.build(),
            ToolkitKind::Sparse.build(),
            Arc::new(SparseSolver::iterative()),
        ];
        for toolkit in toolkits {
            let prepared = toolkit.to_matrix(&a).unwrap();
            assert_eq!(prepared.dim(), 2);

            let x1 = prepared.solve(&dvector![c(1.0, 0.0), c(0.0, 0.0)]).unwrap();
            let x2 = prepared.solve(&dvector![c(0.0, 0.0), c(1.0, 0.0)]).unwrap();

            // Columns of the inverse of [2 1; 1 3]
            assert_relative_eq!(x1[0].re, 0.6, epsilon = 1e-9);
            assert_relative_eq!(x1[1].re, -0.2, epsilon = 1e-9);
            assert_relative_eq!(x2[0].re, -0.2, epsilon = 1e-9);
            assert_relative_eq!(x2[1].re, 0.4, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_toolkit_kind_parsing() {
        assert_eq!("dense".parse::<ToolkitKind>().unwrap(), ToolkitKind::Dense);
        assert_eq!("Sparse".parse::<ToolkitKind>().unwrap(), ToolkitKind::Sparse);
        assert!("symbolic".parse::<ToolkitKind>().is_err());
        assert_eq!(ToolkitKind::default().build().name(), "dense");

        let json = serde_json::to_string(&ToolkitKind::Sparse).unwrap();
        assert_eq!(json, "\"sparse\"");
    }
}
