use thiserror::Error;

/// Canonical result for the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error.
///
/// `Clone` so that a failure captured by a task can be handed to every joiner.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Evaluation error: {0}")]
    Eval(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Pipeline aborted")]
    Aborted,

    #[error("Pool error: {0}")]
    Pool(String),
}

impl Error {
    /// Shorthand used by expression implementations.
    pub fn eval(msg: impl Into<String>) -> Self {
        Error::Eval(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
