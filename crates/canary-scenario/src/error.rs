//! Scenario error types

use thiserror::Error;

pub type ScenarioResult<T> = Result<T, ScenarioError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScenarioError {
    /// Transition not allowed from the current engine state
    #[error("State error: {0}")]
    State(String),

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("Scenario not found: {0}")]
    NotFound(String),

    /// A frame could not be sent; the engine halts in `Error`
    #[error("Send failed: {0}")]
    Send(String),
}
