//! Manager error types

use canary_core::LinkError;
use thiserror::Error;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Unknown link: {0}")]
    UnknownLink(String),

    #[error("Link already registered: {0}")]
    DuplicateLink(String),

    #[error("Link {0} is not running")]
    LinkNotRunning(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl ManagerError {
    /// The caller addressed a link that does not exist or is not usable
    pub fn is_addressing(&self) -> bool {
        matches!(
            self,
            ManagerError::UnknownLink(_) | ManagerError::LinkNotRunning(_)
        )
    }
}
