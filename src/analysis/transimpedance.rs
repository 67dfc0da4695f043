use log::{debug, info};
use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::{to_complex, to_complex_vector, Analysis, AnalysisOptions, Frequency};
use crate::circuit::CircuitModel;
use crate::error::Result;
use crate::solver::PreparedSystem;

/// Quantity observed at the output of a transfer computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputQuantity {
    /// Voltage of `plus` against `minus` (or the reference)
    Voltage { plus: String, minus: Option<String> },
    /// Current in the branch owned by `element`
    Current { element: String },
}

impl OutputQuantity {
    pub fn voltage(plus: impl Into<String>) -> Self {
        OutputQuantity::Voltage {
            plus: plus.into(),
            minus: None,
        }
    }

    pub fn differential(plus: impl Into<String>, minus: impl Into<String>) -> Self {
        OutputQuantity::Voltage {
            plus: plus.into(),
            minus: Some(minus.into()),
        }
    }

    pub fn current(element: impl Into<String>) -> Self {
        OutputQuantity::Current {
            element: element.into(),
        }
    }
}

/// Transimpedances from every unknown to an output, via the adjoint network.
///
/// Solving `(Gᵗ + sCᵗ)·z = -u` with a unit excitation `u` at the output
/// yields in `z[k]` the response at the output to a unit source at `k`.
pub struct Transimpedance<'a, M: CircuitModel + ?Sized> {
    analysis: Analysis<'a, M>,
}

impl<'a, M: CircuitModel + ?Sized> Transimpedance<'a, M> {
    pub fn new(circuit: &'a M, options: AnalysisOptions) -> Result<Self> {
        Ok(Transimpedance {
            analysis: Analysis::new(circuit, options)?,
        })
    }

    /// One reference-excluded transimpedance vector per output
    pub fn solve(&self, frequency: Frequency, outputs: &[OutputQuantity]) -> Result<Vec<DVector<Complex64>>> {
        info!("transimpedance for {} outputs at s = {}", outputs.len(), frequency.s());
        let reciprocal = reciprocal_system(&self.analysis, frequency.s())?;

        outputs
            .iter()
            .map(|output| {
                let u = adjoint_excitation(self.analysis.circuit(), output)?;
                solve_adjoint(&self.analysis, reciprocal.as_ref(), &u)
            })
            .collect()
    }
}

/// Unit excitation selecting `output`, full size
pub(crate) fn adjoint_excitation<M: CircuitModel + ?Sized>(circuit: &M, output: &OutputQuantity) -> Result<DVector<f64>> {
    let mut u = DVector::zeros(circuit.n());
    match output {
        OutputQuantity::Current { element } => {
            u[circuit.get_branch_index(element)?] = -1.0;
        }
        OutputQuantity::Voltage { plus, minus } => {
            u[circuit.get_node_index(plus)?] = -1.0;
            if let Some(minus) = minus {
                u[circuit.get_node_index(minus)?] = 1.0;
            }
        }
    }
    Ok(u)
}

/// Prepared `Gᵗ + sCᵗ` at the zero state, reference removed
pub(crate) fn reciprocal_system<M: CircuitModel + ?Sized>(
    analysis: &Analysis<'_, M>,
    s: Complex64,
) -> Result<Box<dyn PreparedSystem>> {
    let circuit = analysis.circuit();
    let params = analysis.params();
    let refnode = analysis.refnode();
    let x0 = analysis.zero_state();

    let g = to_complex(&refnode.matrix(&circuit.g(&x0, params)?)?);
    let c = to_complex(&refnode.matrix(&circuit.c(&x0, params)?)?);
    let y = g.transpose() + c.transpose() * s;
    debug!("reciprocal system of size {} prepared", y.nrows());
    analysis.toolkit().to_matrix(&y)
}

/// Solve the adjoint system for a full-size excitation; returns the reduced `z`
pub(crate) fn solve_adjoint<M: CircuitModel + ?Sized>(
    analysis: &Analysis<'_, M>,
    reciprocal: &dyn PreparedSystem,
    u: &DVector<f64>,
) -> Result<DVector<Complex64>> {
    let u = to_complex_vector(&analysis.refnode().vector(u)?);
    reciprocal.solve(&(-u))
}
