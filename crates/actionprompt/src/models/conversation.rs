use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

use super::message::{Message, DEFAULT_CONTENT_TYPE};
use super::role::Role;
use super::tool::Tool;
use crate::providers::base::StreamSink;

pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Where a conversation is in its generate, respond, act cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Empty,
    Composing,
    Sent,
    Responded,
    ActionPending,
    ToolResolved,
    Done,
}

/// Generation parameters carried with a conversation
#[derive(Clone, Default)]
pub struct GenerationOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub stream: Option<Arc<dyn StreamSink>>,
}

impl GenerationOptions {
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stream(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.stream = Some(sink);
        self
    }

    /// Values set on `other` win over ours
    pub fn merge(&self, other: &GenerationOptions) -> GenerationOptions {
        GenerationOptions {
            model: other.model.clone().or_else(|| self.model.clone()),
            temperature: other.temperature.or(self.temperature),
            max_tokens: other.max_tokens.or(self.max_tokens),
            stream: other.stream.clone().or_else(|| self.stream.clone()),
        }
    }
}

impl fmt::Debug for GenerationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationOptions")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// The transcript plus everything needed to send it to a provider.
///
/// Message order is the conversation order. When instructions are set they
/// are always the system message at index 0.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub actions: Vec<Tool>,
    pub action_choice: Option<String>,
    pub options: GenerationOptions,
    pub content_type: String,
    pub charset: String,
    pub context: Vec<Value>,
    pub context_id: Option<String>,
    pub params: Map<String, Value>,
    instructions: Option<String>,
    messages: Vec<Message>,
    parts: Vec<Message>,
    headers: Map<String, Value>,
    state: ConversationState,
}

impl Default for Conversation {
    fn default() -> Self {
        Conversation {
            actions: Vec::new(),
            action_choice: None,
            options: GenerationOptions::default(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            charset: DEFAULT_CHARSET.to_string(),
            context: Vec::new(),
            context_id: None,
            params: Map::new(),
            instructions: None,
            messages: Vec::new(),
            parts: Vec::new(),
            headers: Map::new(),
            state: ConversationState::Empty,
        }
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instructions<S: Into<String>>(mut self, instructions: S) -> Self {
        self.set_instructions(instructions);
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.set_messages(messages);
        self
    }

    /// Append a user turn with the given text
    pub fn with_message<S: Into<String>>(mut self, text: S) -> Self {
        self.push(Message::user().with_text(text));
        self
    }

    pub fn with_actions(mut self, actions: Vec<Tool>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn parts(&self) -> &[Message] {
        &self.parts
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn header_map(&self) -> &Map<String, Value> {
        &self.headers
    }

    /// The most recent non-system turn
    pub fn message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role != Role::System)
    }

    /// The most recent turn of any role
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn set_instructions<S: Into<String>>(&mut self, instructions: S) {
        let instructions = instructions.into();
        self.instructions = if instructions.is_empty() {
            None
        } else {
            Some(instructions)
        };
        self.normalize_messages();
    }

    /// Replace the transcript wholesale
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.normalize_messages();
        if !self.messages.is_empty() && self.state == ConversationState::Empty {
            self.state = ConversationState::Composing;
        }
    }

    /// Make sure the instructions are the system message at position 0
    pub fn normalize_messages(&mut self) {
        let Some(instructions) = &self.instructions else {
            return;
        };

        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                if first.content != *instructions {
                    first.content = instructions.clone();
                }
            }
            _ => {
                self.messages
                    .insert(0, Message::system().with_text(instructions.clone()));
            }
        }

        if self.state == ConversationState::Empty {
            self.state = ConversationState::Composing;
        }
    }

    /// Append a turn and advance the turn state
    pub fn push(&mut self, message: Message) {
        self.state = match message.role {
            Role::System | Role::User => match self.state {
                ConversationState::Empty => ConversationState::Composing,
                state => state,
            },
            Role::Assistant if message.is_action_requested() => ConversationState::ActionPending,
            Role::Assistant => ConversationState::Responded,
            Role::Tool => ConversationState::ToolResolved,
        };
        self.messages.push(message);
    }

    /// Mutable access to the latest turn, used while accumulating a stream
    pub fn last_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut()
    }

    /// Add a rendered content fragment.
    ///
    /// The fragment always lands in `parts`. When its content type matches
    /// the conversation's and there is no primary message content yet it also
    /// becomes the primary message.
    pub fn add_part(&mut self, part: Message) {
        let mut part = part;
        if part.charset.is_none() {
            part.charset = Some(self.charset.clone());
        }
        self.parts.push(part.clone());

        if part.content_type != self.content_type {
            return;
        }

        let primary = self
            .messages
            .iter()
            .rposition(|m| m.role != Role::System);
        match primary {
            Some(index) if self.messages[index].content.is_empty() => {
                self.messages[index] = part;
            }
            Some(_) => {}
            None => self.push(part),
        }
    }

    pub fn is_multipart(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Merge transport metadata, later values win
    pub fn headers(&mut self, extra: Map<String, Value>) -> &Map<String, Value> {
        for (key, value) in extra {
            self.headers.insert(key, value);
        }
        &self.headers
    }

    pub fn mark_sent(&mut self) {
        self.state = ConversationState::Sent;
    }

    pub fn mark_done(&mut self) {
        self.state = ConversationState::Done;
    }

    pub fn to_canonical(&self) -> Value {
        json!({
            "actions": self.actions,
            "action_choice": self.action_choice,
            "instructions": self.instructions.clone().unwrap_or_default(),
            "message": self.message().map(Message::to_canonical),
            "messages": self.messages.iter().map(Message::to_canonical).collect::<Vec<_>>(),
            "headers": self.headers,
            "context": self.context,
        })
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{}", message),
            None => Ok(()),
        }
    }
}
