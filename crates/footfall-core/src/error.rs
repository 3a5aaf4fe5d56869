use thiserror::Error;

/// Application-wide error types for footfall.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration failed to parse or validate.
    #[error("invalid config: {0}")]
    Config(String),

    /// Target selector could not be built.
    #[error("selector error: {0}")]
    Selector(String),

    /// The operation was interrupted by the top-level cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Result output file could not be opened or written.
    #[error("output error: {0}")]
    Output(String),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AppError {
    /// Returns true if this error is cancellation propagating from the
    /// top-level token rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_cancelled() {
        assert!(AppError::Cancelled.is_cancelled());
        assert!(!AppError::Config("bad".into()).is_cancelled());
    }
}
