use nalgebra::{ComplexField, DMatrix, DVector};

use crate::error::{AnalysisError, Result};

/// Reference-node elimination for nodal systems of dimension `size`.
///
/// The reference row and column of a nodal matrix are linearly dependent on
/// the others (KCL), so they are dropped before a solve and the reference
/// potential is put back as zero afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefNode {
    index: usize,
    size: usize,
}

/// A matrix or vector taking part in a batched elimination.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand<T: ComplexField> {
    Matrix(DMatrix<T>),
    Vector(DVector<T>),
}

impl RefNode {
    pub fn new(index: usize, size: usize) -> Result<Self> {
        if index >= size {
            return Err(AnalysisError::IndexOutOfRange { index, size });
        }
        Ok(RefNode { index, size })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Full (uneliminated) system dimension
    pub fn size(&self) -> usize {
        self.size
    }

    /// Remove the reference row and column from an `n x n` matrix
    pub fn matrix<T: ComplexField>(&self, matrix: &DMatrix<T>) -> Result<DMatrix<T>> {
        self.check_len(matrix.nrows())?;
        self.check_len(matrix.ncols())?;
        Ok(matrix.clone().remove_row(self.index).remove_column(self.index))
    }

    /// Remove the reference entry from a length-`n` vector
    pub fn vector<T: ComplexField>(&self, vector: &DVector<T>) -> Result<DVector<T>> {
        self.check_len(vector.len())?;
        Ok(vector.clone().remove_row(self.index))
    }

    /// Put a zero back at the reference position of a length `n-1` solution
    pub fn reinsert<T: ComplexField>(&self, reduced: &DVector<T>) -> Result<DVector<T>> {
        if reduced.len() + 1 != self.size {
            return Err(AnalysisError::DimensionMismatch {
                expected: self.size - 1,
                actual: reduced.len(),
            });
        }
        Ok(reduced.clone().insert_row(self.index, T::zero()))
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.size {
            return Err(AnalysisError::DimensionMismatch {
                expected: self.size,
                actual: len,
            });
        }
        Ok(())
    }
}

/// Remove row/column `index` from every operand, keeping their order.
///
/// All operands must share the same dimension along every axis.
pub fn remove_row_col<T: ComplexField>(operands: &[Operand<T>], index: usize) -> Result<Vec<Operand<T>>> {
    let size = match operands.first() {
        Some(Operand::Matrix(m)) => m.nrows(),
        Some(Operand::Vector(v)) => v.len(),
        None => return Ok(Vec::new()),
    };
    let refnode = RefNode::new(index, size)?;

    operands
        .iter()
        .map(|operand| match operand {
            Operand::Matrix(m) => refnode.matrix(m).map(Operand::Matrix),
            Operand::Vector(v) => refnode.vector(v).map(Operand::Vector),
        })
        .collect()
}
