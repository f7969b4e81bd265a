use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumIter};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Invalid role: {role}. Valid roles are: {allowed}")]
    InvalidRole { role: String, allowed: String },

    #[error("Generation provider error: {0}")]
    Provider(String),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("{provider} does not support {operation}")]
    Unsupported { provider: String, operation: String },

    #[error(
        "The prompt was accessed before asking to generate it later. Local changes would be \
         silently lost because only the action arguments are passed to the generation job; \
         do not touch the conversation before calling run_later"
    )]
    PromptAccessed,

    #[error("Action requested again with identical parameters: {0}")]
    RepeatedAction(String),

    #[error("No generation queue configured for agent {0}")]
    QueueUnavailable(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Discriminant of [`AgentError`], used to key rescue handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidRole,
    Provider,
    ActionNotFound,
    Action,
    Unsupported,
    PromptAccessed,
    RepeatedAction,
    QueueUnavailable,
    AgentNotFound,
    Config,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::InvalidRole { .. } => ErrorKind::InvalidRole,
            AgentError::Provider(_) => ErrorKind::Provider,
            AgentError::ActionNotFound(_) => ErrorKind::ActionNotFound,
            AgentError::Action(_) => ErrorKind::Action,
            AgentError::Unsupported { .. } => ErrorKind::Unsupported,
            AgentError::PromptAccessed => ErrorKind::PromptAccessed,
            AgentError::RepeatedAction(_) => ErrorKind::RepeatedAction,
            AgentError::QueueUnavailable(_) => ErrorKind::QueueUnavailable,
            AgentError::AgentNotFound(_) => ErrorKind::AgentNotFound,
            AgentError::Config(_) => ErrorKind::Config,
        }
    }

    /// Wrap any failure crossing the provider boundary
    pub fn provider<E: std::fmt::Display>(err: E) -> Self {
        AgentError::Provider(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
