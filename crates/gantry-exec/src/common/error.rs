use thiserror::Error;

use crate::resources::ResourceError;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Launch failure: {0}")]
    LaunchFailure(String),
    #[error(transparent)]
    ResourceError(#[from] ResourceError),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<String> for ExecError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for ExecError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
