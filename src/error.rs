use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq)]
pub enum GanError {
    /// Unparseable normalisation spec or unknown loss mode.
    Configuration(String),
    /// Bad setup argument, e.g. a non-positive iteration count or a missing weight.
    InvalidArgument(String),
    /// A caller-side logic bug, e.g. generator hinge loss aimed at a fake target.
    InvariantViolation(String),
    /// Operation not valid in the current state, e.g. removing an estimator never applied.
    InvalidState(String),
}

impl Display for GanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

impl std::error::Error for GanError {}

pub type Result<T> = std::result::Result<T, GanError>;
