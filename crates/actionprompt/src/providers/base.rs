use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AgentError, AgentResult};
use crate::models::conversation::Conversation;
use crate::models::message::Message;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// The outcome of one completed generation call
#[derive(Debug, Clone)]
pub struct Response {
    pub conversation: Conversation,
    message: Option<Message>,
    /// Provider payload as received, kept for diagnostics
    pub raw: Option<Value>,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl Response {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            message: None,
            raw: None,
            usage: None,
            stop_reason: None,
            embedding: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_stop_reason(mut self, stop_reason: Option<String>) -> Self {
        self.stop_reason = stop_reason;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The produced message, falling back to the conversation's current message
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref().or_else(|| self.conversation.message())
    }
}

/// Receives incremental content while a streamed generation is in flight.
///
/// `delta` is the text that just arrived; the final call carries no delta
/// and `is_final == true`.
pub trait StreamSink: Send + Sync {
    fn on_delta(&self, message: &Message, delta: Option<&str>, is_final: bool);
}

impl<F> StreamSink for F
where
    F: Fn(&Message, Option<&str>, bool) + Send + Sync,
{
    fn on_delta(&self, message: &Message, delta: Option<&str>, is_final: bool) {
        self(message, delta, is_final)
    }
}

/// Base trait for generation providers (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs and error messages
    fn name(&self) -> &str;

    /// Send the conversation, append the reply to it and return both
    async fn generate(&self, conversation: Conversation) -> AgentResult<Response>;

    /// Compute an embedding for the conversation's current message
    async fn embed(&self, _conversation: Conversation) -> AgentResult<Response> {
        Err(AgentError::Unsupported {
            provider: self.name().to_string(),
            operation: "embed".to_string(),
        })
    }
}
