//! Error type for the detector orchestration layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Core(#[from] lg_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Downstream prediction is defined on the scene graph
    #[error("Configuration error: downstream prediction requires a graph head")]
    MissingGraphHead,

    #[error("Generic forward dispatch is not supported; call `loss` or `predict`")]
    UnsupportedForward,

    #[error("Collaborator does not support {0}")]
    Unsupported(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
