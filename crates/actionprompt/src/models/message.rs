use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use super::action::Action;
use super::role::Role;
use crate::errors::AgentError;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
pub const IMAGE_URL_CONTENT_TYPE: &str = "image_url";

/// Loosely typed message attributes, validated by `Message::try_from`.
///
/// Every key is optional: role defaults to `user`, content to the empty
/// string and content type to `text/plain`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageParams {
    pub role: Option<String>,
    pub content: Option<String>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub name: Option<String>,
    pub action_id: Option<String>,
    pub requested_actions: Vec<Action>,
}

/// One turn of a conversation.
///
/// Deserialization goes through [`MessageParams`], so a bad role is reported
/// as `AgentError::InvalidRole`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MessageParams")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requested_actions: Vec<Action>,
}

impl Default for Message {
    fn default() -> Self {
        Message::new(Role::default())
    }
}

impl TryFrom<MessageParams> for Message {
    type Error = AgentError;

    fn try_from(params: MessageParams) -> Result<Self, Self::Error> {
        let role = match params.role.as_deref() {
            Some(role) => Role::parse(role)?,
            None => Role::default(),
        };

        Ok(Message {
            role,
            content: params.content.unwrap_or_default(),
            content_type: params
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            charset: params.charset,
            name: params.name,
            action_id: params.action_id,
            requested_actions: params.requested_actions,
        })
    }
}

impl Message {
    /// Create an empty plain text message for `role`
    pub fn new(role: Role) -> Self {
        Message {
            role,
            content: String::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            charset: None,
            name: None,
            action_id: None,
            requested_actions: Vec::new(),
        }
    }

    /// Create a message from a role name, validating it
    pub fn with_role_name<S: Into<String>>(role: &str, content: S) -> Result<Self, AgentError> {
        Ok(Message::new(Role::parse(role)?).with_text(content))
    }

    pub fn system() -> Self {
        Message::new(Role::System)
    }

    pub fn user() -> Self {
        Message::new(Role::User)
    }

    pub fn assistant() -> Self {
        Message::new(Role::Assistant)
    }

    pub fn tool() -> Self {
        Message::new(Role::Tool)
    }

    /// Set the text content of the message
    pub fn with_text<S: Into<String>>(mut self, text: S) -> Self {
        self.content = text.into();
        self
    }

    /// Reference an image by URL or data URI
    pub fn with_image_url<S: Into<String>>(self, url: S) -> Self {
        self.with_text(url).with_content_type(IMAGE_URL_CONTENT_TYPE)
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_charset<S: Into<String>>(mut self, charset: S) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_action_id<S: Into<String>>(mut self, action_id: S) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_requested_actions(mut self, actions: Vec<Action>) -> Self {
        self.requested_actions = actions;
        self
    }

    pub fn is_action_requested(&self) -> bool {
        !self.requested_actions.is_empty()
    }

    pub fn is_image(&self) -> bool {
        self.content_type == IMAGE_URL_CONTENT_TYPE
    }

    /// Append streamed text to the content
    pub fn append(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    /// Plain mapping handed to provider serialization.
    ///
    /// Optional keys are left out when absent, empty or at their default so
    /// that the payload stays compact; `action_requested` is always present.
    pub fn to_canonical(&self) -> Value {
        let mut canonical = json!({
            "role": self.role,
            "content": self.content,
        });

        if self.content_type != DEFAULT_CONTENT_TYPE {
            canonical["content_type"] = json!(self.content_type);
        }
        if let Some(charset) = &self.charset {
            canonical["charset"] = json!(charset);
        }
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            canonical["name"] = json!(name);
        }
        if let Some(action_id) = self.action_id.as_deref().filter(|id| !id.is_empty()) {
            canonical["action_id"] = json!(action_id);
        }
        canonical["action_requested"] = json!(self.is_action_requested());
        if self.is_action_requested() {
            canonical["requested_actions"] = Value::Array(
                self.requested_actions
                    .iter()
                    .map(Action::to_canonical)
                    .collect(),
            );
        }

        canonical
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}
