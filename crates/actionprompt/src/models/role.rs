use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::errors::AgentError;

/// The speaker of a conversation turn
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Comma separated list of the accepted role names
    pub fn allowed() -> String {
        Role::iter()
            .map(|role| role.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Parse a role name, failing with [`AgentError::InvalidRole`]
    pub fn parse(value: &str) -> Result<Self, AgentError> {
        Role::from_str(value).map_err(|_| AgentError::InvalidRole {
            role: value.to_string(),
            allowed: Role::allowed(),
        })
    }
}
