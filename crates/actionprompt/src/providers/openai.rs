use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::base::{Provider, Response, StreamSink};
use super::configs::OpenAiProviderConfig;
use super::stream::{for_each_event, DONE_SENTINEL};
use super::utils::{
    check_openai_context_length_error, check_status, embedding_from_response,
    messages_to_openai_spec, openai_message, openai_response_to_message, openai_usage,
    sanitize_function_name, tools_to_openai_spec,
};
use crate::errors::{AgentError, AgentResult};
use crate::models::conversation::Conversation;
use crate::models::message::Message;

/// Adapter for every endpoint speaking the OpenAI chat completions format.
///
/// OpenAI, Ollama and OpenRouter differ only in base URL, default model and
/// whether an API key is sent, so one type covers all three.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()
            .map_err(AgentError::provider)?;

        Ok(Self { client, config })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.host.trim_end_matches('/'), endpoint)
    }

    async fn send(&self, endpoint: &str, payload: &Value) -> Result<reqwest::Response> {
        let url = self.url(endpoint);
        tracing::debug!(provider = self.name(), %url, "sending request");

        let mut request = self.client.post(&url).json(payload);
        if let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        check_status(request.send().await?).await
    }

    async fn post(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        let response: Value = self.send(endpoint, payload).await?.json().await?;

        // Some compatible servers report failures in a 200 body
        if let Some(error) = response.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        Ok(response)
    }

    fn payload(&self, conversation: &Conversation) -> Result<Value> {
        let options = &conversation.options;
        let mut payload = json!({
            "model": options.model.clone().unwrap_or_else(|| self.config.model.clone()),
            "messages": messages_to_openai_spec(conversation.messages()),
        });

        if let Some(temperature) = options.temperature.or(self.config.temperature) {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens.or(self.config.max_tokens) {
            payload["max_tokens"] = json!(max_tokens);
        }
        if !conversation.actions.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(&conversation.actions)?);
            if let Some(choice) = &conversation.action_choice {
                payload["tool_choice"] = json!({
                    "type": "function",
                    "function": { "name": sanitize_function_name(choice) }
                });
            }
        }

        Ok(payload)
    }

    async fn complete(&self, mut conversation: Conversation) -> Result<Response> {
        let payload = self.payload(&conversation)?;
        conversation.mark_sent();

        let raw = self.post("chat/completions", &payload).await?;
        let (message, stop_reason) = openai_response_to_message(&raw)?;
        let usage = openai_usage(&raw);

        conversation.push(message.clone());
        let mut response = Response::new(conversation)
            .with_message(message)
            .with_raw(raw)
            .with_stop_reason(stop_reason);
        if let Some(usage) = usage {
            response = response.with_usage(usage);
        }
        Ok(response)
    }

    async fn stream(
        &self,
        mut conversation: Conversation,
        sink: Option<Arc<dyn StreamSink>>,
    ) -> Result<Response> {
        let mut payload = self.payload(&conversation)?;
        payload["stream"] = json!(true);
        conversation.mark_sent();

        let response = self.send("chat/completions", &payload).await?;

        let mut message = Message::assistant();
        let mut stop_reason = None;
        for_each_event(response, |_, data| {
            if data == DONE_SENTINEL {
                return Ok(false);
            }

            let chunk: Value = serde_json::from_str(data)?;
            let choice = &chunk["choices"][0];
            if let Some(reason) = choice["finish_reason"].as_str() {
                stop_reason = Some(reason.to_string());
            }

            let delta = &choice["delta"];
            if delta["tool_calls"].is_array() {
                message
                    .requested_actions
                    .extend(openai_message(delta).requested_actions);
            }

            if let Some(content) = delta["content"].as_str().filter(|c| !c.is_empty()) {
                message.append(content);
                if let Some(sink) = &sink {
                    sink.on_delta(&message, Some(content), false);
                }
            }

            Ok(true)
        })
        .await?;

        if !message.content.is_empty() || message.is_action_requested() {
            conversation.push(message.clone());
        }
        if let Some(sink) = &sink {
            sink.on_delta(&message, None, true);
        }

        Ok(Response::new(conversation)
            .with_message(message)
            .with_stop_reason(stop_reason))
    }

    async fn embedding(&self, conversation: Conversation) -> Result<Response> {
        let input = conversation
            .message()
            .map(|m| m.content.clone())
            .ok_or_else(|| anyhow!("Nothing to embed: the conversation has no message"))?;

        let payload = json!({
            "model": self.config.embedding_model,
            "input": input,
        });

        let raw = self.post("embeddings", &payload).await?;
        let embedding = embedding_from_response(&raw)?;

        Ok(Response::new(conversation)
            .with_embedding(embedding)
            .with_raw(raw))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        self.config.service.as_ref()
    }

    async fn generate(&self, conversation: Conversation) -> AgentResult<Response> {
        let sink = conversation.options.stream.clone();
        let result = if sink.is_some() || self.config.stream {
            self.stream(conversation, sink).await
        } else {
            self.complete(conversation).await
        };
        result.map_err(AgentError::provider)
    }

    async fn embed(&self, conversation: Conversation) -> AgentResult<Response> {
        self.embedding(conversation)
            .await
            .map_err(AgentError::provider)
    }
}
