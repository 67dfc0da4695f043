use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use super::{to_complex, to_complex_vector, Analysis, AnalysisOptions, Frequency};
use crate::circuit::{AnalysisMode, CircuitModel};
use crate::elimination::{remove_row_col, Operand};
use crate::error::{AnalysisError, Result};
use crate::result::{AcPoint, AcResult};

/// Small-signal frequency-domain analysis around the all-zero state
pub struct Ac<'a, M: CircuitModel + ?Sized> {
    analysis: Analysis<'a, M>,
}

/// `G`, `C` and `u` with the reference removed
struct ReducedSystem {
    g: DMatrix<Complex64>,
    c: DMatrix<Complex64>,
    u: DVector<Complex64>,
}

impl<'a, M: CircuitModel + ?Sized> Ac<'a, M> {
    pub fn new(circuit: &'a M, options: AnalysisOptions) -> Result<Self> {
        Ok(Ac {
            analysis: Analysis::new(circuit, options)?,
        })
    }

    pub fn analysis(&self) -> &Analysis<'a, M> {
        &self.analysis
    }

    /// Solve `(sC + G)·x = -u` at one frequency.
    ///
    /// `u` overrides the circuit's AC excitation and must have full size.
    pub fn solve_point(&self, frequency: Frequency, u: Option<&DVector<Complex64>>) -> Result<AcPoint<'a, M>> {
        let xdcop = self.analysis.zero_state();
        let system = self.reduced_system(&xdcop, u)?;
        self.solve_reduced(&system, xdcop, frequency.s())
    }

    /// Sweep over frequencies in Hz
    pub fn solve(&self, frequencies: &[f64]) -> Result<AcResult<'a, M>> {
        let points: Vec<Frequency> = frequencies.iter().map(|&f| Frequency::Hz(f)).collect();
        self.sweep(&points)
    }

    /// Sweep over complex frequencies `s`
    pub fn solve_complex(&self, s: &[Complex64]) -> Result<AcResult<'a, M>> {
        let points: Vec<Frequency> = s.iter().map(|&s| Frequency::Complex(s)).collect();
        self.sweep(&points)
    }

    fn sweep(&self, frequencies: &[Frequency]) -> Result<AcResult<'a, M>> {
        info!("AC sweep over {} points", frequencies.len());
        let xdcop = self.analysis.zero_state();
        let system = self.reduced_system(&xdcop, None)?;

        let points = frequencies
            .iter()
            .map(|f| self.solve_reduced(&system, xdcop.clone(), f.s()))
            .collect::<Result<Vec<_>>>()?;

        let hz = frequencies.iter().map(Frequency::hz).collect();
        Ok(AcResult::new(self.analysis.circuit(), hz, points))
    }

    fn reduced_system(&self, xdcop: &DVector<f64>, u: Option<&DVector<Complex64>>) -> Result<ReducedSystem> {
        let circuit = self.analysis.circuit();
        let params = self.analysis.params();

        let u = match u {
            Some(u) => u.clone(),
            None => to_complex_vector(&circuit.u(xdcop, AnalysisMode::Ac, params)?),
        };
        let operands = [
            Operand::Matrix(to_complex(&circuit.g(xdcop, params)?)),
            Operand::Matrix(to_complex(&circuit.c(xdcop, params)?)),
            Operand::Vector(u),
        ];

        let mut reduced = remove_row_col(&operands, self.analysis.refnode().index())?.into_iter();
        match (reduced.next(), reduced.next(), reduced.next()) {
            (Some(Operand::Matrix(g)), Some(Operand::Matrix(c)), Some(Operand::Vector(u))) => {
                Ok(ReducedSystem { g, c, u })
            }
            _ => Err(AnalysisError::configuration("reference elimination changed the operand layout")),
        }
    }

    fn solve_reduced(&self, system: &ReducedSystem, xdcop: DVector<f64>, s: Complex64) -> Result<AcPoint<'a, M>> {
        debug!("AC point at s = {}", s);
        let a = &system.c * s + &system.g;
        let x = self.analysis.toolkit().linear_solver_complex(&a, &(-&system.u))?;
        let x = self.analysis.refnode().reinsert(&x)?;

        Ok(AcPoint::new(
            self.analysis.circuit(),
            self.analysis.params().clone(),
            xdcop,
            s,
            x,
        ))
    }
}
