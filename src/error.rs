use thiserror::Error;

/// Errors raised by the analysis engine.
///
/// Every variant is fatal to the analysis call that produced it. Callers can
/// match on the kind to tell a bad setup apart from a numerical failure.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Invalid analysis setup, detected when the analysis is constructed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Newton iteration exhausted its budget without meeting the residual tolerance
    #[error("no convergence after {iterations} iterations (residual {residual:.3e})")]
    NoConvergence { iterations: usize, residual: f64 },

    /// Coefficient matrix of a linear solve is numerically singular
    #[error("singular matrix - circuit may have a floating node or a misplaced reference")]
    SingularMatrix,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index {index} out of range for dimension {size}")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown element '{0}'")]
    UnknownElement(String),

    #[error("unknown terminal '{0}'")]
    UnknownTerminal(String),
}

impl AnalysisError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for the numerical failure kinds (as opposed to setup or lookup errors).
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::NoConvergence { .. } | Self::SingularMatrix)
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let errors = [
            AnalysisError::configuration("output is not specified"),
            AnalysisError::NoConvergence { iterations: 50, residual: 1e-3 },
            AnalysisError::SingularMatrix,
        ];

        assert!(matches!(errors[0], AnalysisError::Configuration(_)));
        assert!(!errors[0].is_numerical());
        assert!(errors[1].is_numerical());
        assert!(errors[2].is_numerical());
    }

    #[test]
    fn test_error_messages() {
        let err = AnalysisError::NoConvergence { iterations: 3, residual: 0.5 };
        assert_eq!(err.to_string(), "no convergence after 3 iterations (residual 5.000e-1)");

        let err = AnalysisError::configuration("output is not specified");
        assert_eq!(err.to_string(), "configuration error: output is not specified");
    }
}
