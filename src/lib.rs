pub mod analysis;
pub mod circuit;
pub mod cli;
pub mod elimination;
pub mod error;
pub mod mna;
pub mod newton;
pub mod parser;
pub mod result;
pub mod simulator;
pub mod solver;

// Re-export commonly used types
pub use analysis::{
    Ac, AnalysisOptions, ExplicitTransient, Frequency, ImplicitTransient, Noise, NoiseConfig, OutputQuantity,
    Transimpedance, TransientParams,
};
pub use circuit::{AnalysisMode, Circuit, CircuitModel, Component, EvalParams, Node, SourceKind};
pub use error::{AnalysisError, Result};
pub use newton::NewtonConfig;
pub use parser::SpiceParser;
pub use result::{AcResult, NoiseKey, NoiseResult, TransientResult, Waveform};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
pub use solver::{LinearSolver, SparseSolver, Toolkit, ToolkitKind};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
