use thiserror::Error;

use crate::common::error::GantryError::GenericError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GantryError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Execution error: {0}")]
    ExecError(#[from] gantry_exec::Error),
    #[error("Upstream store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Status updates of the listed jobs never reached upstream.
    #[error("Status of job(s) {0} was lost")]
    StatusLost(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl GantryError {
    /// Errors after which the launcher cannot make any further safe decision.
    pub fn is_fatal(&self) -> bool {
        match self {
            GantryError::ExecError(gantry_exec::Error::ResourceError(error)) => error.is_fatal(),
            GantryError::ConfigError(_) => true,
            _ => false,
        }
    }
}

impl From<gantry_exec::resources::ResourceError> for GantryError {
    fn from(error: gantry_exec::resources::ResourceError) -> Self {
        Self::ExecError(error.into())
    }
}

impl From<serde_json::error::Error> for GantryError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for GantryError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<toml::de::Error> for GantryError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<toml::ser::Error> for GantryError {
    fn from(error: toml::ser::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for GantryError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
