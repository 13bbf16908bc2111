use core::fmt;

/// Error returned by fallible constructors and protocol-sensitive operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Specific failure modes. See module docs for which are fatal and which are
/// only ever raised as a result of caller-supplied kernel or likelihood bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `X`, `Y`, or `R` have inconsistent or unexpected shapes at construction.
    ShapeMismatch,
    /// Inputs to a Markov-variant model are not sorted by time.
    UnsortedTime,
    /// A covariance matrix remained non-positive-semi-definite after jitter
    /// was added once. This indicates a bug in a caller-supplied kernel.
    CovarianceNotPositiveSemiDefinite,
    /// `conditional_data_to_posterior` was called without a preceding
    /// `conditional_posterior_to_data` in the same inference step.
    MissingConditionalProjector,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorKind::ShapeMismatch => "input shapes are inconsistent",
            ErrorKind::UnsortedTime => "Markov model inputs must be sorted by time",
            ErrorKind::CovarianceNotPositiveSemiDefinite => {
                "covariance matrix is not positive semi-definite even after jitter"
            }
            ErrorKind::MissingConditionalProjector => {
                "conditional_data_to_posterior called before conditional_posterior_to_data"
            }
        };
        write!(f, "{}", msg)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind }
    }
}
