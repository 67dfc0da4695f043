pub mod ac;
pub mod noise;
pub mod transient;
pub mod transimpedance;

pub use ac::Ac;
pub use noise::{Noise, NoiseConfig};
pub use transient::{ExplicitTransient, History, ImplicitTransient, TransientParams};
pub use transimpedance::{OutputQuantity, Transimpedance};

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use log::info;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use crate::circuit::{CircuitModel, EvalParams};
use crate::elimination::RefNode;
use crate::error::Result;
use crate::solver::{LinearSolver, Toolkit};

/// Settings shared by every analysis
#[derive(Clone)]
pub struct AnalysisOptions {
    /// Linear-algebra backend
    pub toolkit: Arc<dyn Toolkit>,
    pub params: EvalParams,
    /// Reference node name; the circuit's ground when `None`
    pub refnode: Option<String>,
}

impl Default for AnalysisOptions {
    /// Dense LU toolkit, default physical parameters, ground as reference
    fn default() -> Self {
        AnalysisOptions {
            toolkit: Arc::new(LinearSolver::new()),
            params: EvalParams::default(),
            refnode: None,
        }
    }
}

impl AnalysisOptions {
    pub fn with_toolkit(mut self, toolkit: Arc<dyn Toolkit>) -> Self {
        self.toolkit = toolkit;
        self
    }

    pub fn with_params(mut self, params: EvalParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_refnode(mut self, refnode: impl Into<String>) -> Self {
        self.refnode = Some(refnode.into());
        self
    }
}

impl fmt::Debug for AnalysisOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisOptions")
            .field("toolkit", &self.toolkit.name())
            .field("params", &self.params)
            .field("refnode", &self.refnode)
            .finish()
    }
}

/// Frequency of a small-signal evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frequency {
    /// Real frequency in Hz, `s = 2πjf`
    Hz(f64),
    /// Complex frequency used as is
    Complex(Complex64),
}

impl Frequency {
    pub fn s(&self) -> Complex64 {
        match *self {
            Frequency::Hz(f) => Complex64::new(0.0, 2.0 * PI * f),
            Frequency::Complex(s) => s,
        }
    }

    /// Angular frequency `Im(s)`
    pub fn omega(&self) -> f64 {
        self.s().im
    }

    /// Frequency in Hz corresponding to `Im(s)`
    pub fn hz(&self) -> f64 {
        match *self {
            Frequency::Hz(f) => f,
            Frequency::Complex(s) => s.im / (2.0 * PI),
        }
    }
}

/// State every analysis carries: the circuit, its toolkit, the evaluation
/// parameters and the resolved reference node.
#[derive(Clone)]
pub struct Analysis<'a, M: CircuitModel + ?Sized> {
    circuit: &'a M,
    toolkit: Arc<dyn Toolkit>,
    params: EvalParams,
    refnode: RefNode,
}

impl<'a, M: CircuitModel + ?Sized> Analysis<'a, M> {
    /// Bind a circuit to its options and let the toolkit adjust the parameters
    pub fn new(circuit: &'a M, options: AnalysisOptions) -> Result<Self> {
        let AnalysisOptions {
            toolkit,
            mut params,
            refnode,
        } = options;

        toolkit.setup_analysis(&mut params);
        let index = circuit.reference_index(refnode.as_deref())?;
        let refnode = RefNode::new(index, circuit.n())?;

        info!(
            "analysis on {} unknowns with {} toolkit, reference index {}",
            circuit.n(),
            toolkit.name(),
            index
        );

        Ok(Analysis {
            circuit,
            toolkit,
            params,
            refnode,
        })
    }

    pub fn circuit(&self) -> &'a M {
        self.circuit
    }

    pub fn toolkit(&self) -> &dyn Toolkit {
        self.toolkit.as_ref()
    }

    pub fn params(&self) -> &EvalParams {
        &self.params
    }

    pub fn refnode(&self) -> RefNode {
        self.refnode
    }

    /// All-zero full-size state
    pub fn zero_state(&self) -> DVector<f64> {
        DVector::zeros(self.circuit.n())
    }
}

pub(crate) fn to_complex(matrix: &DMatrix<f64>) -> DMatrix<Complex64> {
    matrix.map(|v| Complex64::new(v, 0.0))
}

pub(crate) fn to_complex_vector(vector: &DVector<f64>) -> DVector<Complex64> {
    vector.map(|v| Complex64::new(v, 0.0))
}
