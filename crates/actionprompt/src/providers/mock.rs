use async_trait::async_trait;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::{AgentError, AgentResult};
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::providers::base::{Provider, Response, Usage};

lazy_static! {
    // Every conversation sent through a mock provider, in order
    static ref GENERATIONS: Mutex<Vec<Conversation>> = Mutex::new(Vec::new());
}

/// Conversations generated through any `MockProvider` in this process
pub fn generations() -> Vec<Conversation> {
    GENERATIONS
        .lock()
        .map(|log| log.clone())
        .unwrap_or_default()
}

pub fn clear_generations() {
    if let Ok(mut log) = GENERATIONS.lock() {
        log.clear();
    }
}

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Message>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, mut conversation: Conversation) -> AgentResult<Response> {
        conversation.mark_sent();
        let message = {
            let mut responses = self.responses.lock().map_err(AgentError::provider)?;
            if responses.is_empty() {
                // Return empty response if no more pre-configured responses
                Message::assistant().with_text("")
            } else {
                responses.remove(0)
            }
        };

        if let Some(sink) = &conversation.options.stream {
            if !message.content.is_empty() {
                sink.on_delta(&message, Some(&message.content), false);
            }
            sink.on_delta(&message, None, true);
        }

        conversation.push(message.clone());
        GENERATIONS
            .lock()
            .map_err(AgentError::provider)?
            .push(conversation.clone());

        Ok(Response::new(conversation)
            .with_message(message)
            .with_usage(Usage::default()))
    }
}
