use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::base::{Provider, Response, StreamSink, Usage};
use super::configs::{AnthropicProviderConfig, ANTHROPIC_MAX_TOKENS};
use super::stream::for_each_event;
use super::utils::{check_status, decode_arguments, sanitize_function_name};
use crate::errors::{AgentError, AgentResult};
use crate::models::action::Action;
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()
            .map_err(AgentError::provider)?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usage")?;
        let input_tokens = usage["input_tokens"].as_i64().map(|v| v as i32);
        let output_tokens = usage["output_tokens"].as_i64().map(|v| v as i32);
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Some(Usage::new(input_tokens, output_tokens, total_tokens))
    }

    /// System turns are joined into the top-level `system` field
    fn system_prompt(messages: &[Message]) -> Option<String> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System && !m.content.is_empty())
            .map(|m| m.content.as_str())
            .collect();
        if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        }
    }

    fn messages_to_anthropic_spec(messages: &[Message]) -> Vec<Value> {
        let mut anthropic_messages: Vec<Value> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {}
                Role::User => {
                    let content = if message.is_image() {
                        json!([image_block(&message.content)])
                    } else if message.content.is_empty() {
                        continue;
                    } else {
                        json!(message.content)
                    };
                    anthropic_messages.push(json!({"role": "user", "content": content}));
                }
                Role::Assistant => {
                    let mut content = Vec::new();
                    if !message.content.is_empty() {
                        content.push(json!({"type": "text", "text": message.content}));
                    }
                    for action in &message.requested_actions {
                        content.push(json!({
                            "type": "tool_use",
                            "id": action.id.clone().unwrap_or_else(|| action.name.clone()),
                            "name": sanitize_function_name(&action.name),
                            "input": action.arguments(),
                        }));
                    }
                    if !content.is_empty() {
                        anthropic_messages.push(json!({"role": "assistant", "content": content}));
                    }
                }
                Role::Tool => {
                    let result_content = if message.is_image() {
                        json!([image_block(&message.content)])
                    } else {
                        json!(message.content)
                    };
                    let tool_use_id = message
                        .action_id
                        .clone()
                        .or_else(|| message.name.clone())
                        .unwrap_or_default();
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": result_content,
                    });

                    // Results answering one assistant turn share a single user turn
                    match anthropic_messages.last_mut() {
                        Some(last) if is_tool_result_turn(last) => {
                            if let Some(blocks) = last["content"].as_array_mut() {
                                blocks.push(block);
                            }
                        }
                        _ => anthropic_messages.push(json!({"role": "user", "content": [block]})),
                    }
                }
            }
        }

        anthropic_messages
    }

    fn tools_to_anthropic_spec(tools: &[Tool]) -> Result<Vec<Value>> {
        let mut tool_names = std::collections::HashSet::new();
        let mut result = Vec::new();

        for tool in tools {
            if !tool_names.insert(&tool.name) {
                return Err(anyhow!("Duplicate tool name: {}", tool.name));
            }
            result.push(json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters,
            }));
        }

        Ok(result)
    }

    fn response_to_message(response: &Value) -> Result<Message> {
        let blocks = response
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| anyhow!("Invalid response format from Anthropic API: {}", response))?;

        let mut text = String::new();
        let mut actions = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => {
                    let Some(name) = block["name"].as_str().filter(|n| !n.is_empty()) else {
                        tracing::warn!("skipping tool_use block without a name");
                        continue;
                    };
                    let id = block["id"].as_str().map(String::from);
                    actions.push(Action::new(id, name, decode_arguments(&block["input"])));
                }
                _ => {}
            }
        }

        Ok(Message::assistant()
            .with_text(text)
            .with_requested_actions(actions))
    }

    fn payload(&self, conversation: &Conversation) -> Result<Value> {
        let options = &conversation.options;
        let mut payload = json!({
            "model": options.model.clone().unwrap_or_else(|| self.config.model.clone()),
            "messages": Self::messages_to_anthropic_spec(conversation.messages()),
            "max_tokens": options
                .max_tokens
                .or(self.config.max_tokens)
                .unwrap_or(ANTHROPIC_MAX_TOKENS),
        });

        if let Some(system) = Self::system_prompt(conversation.messages()) {
            payload["system"] = json!(system);
        }
        if let Some(temperature) = options.temperature.or(self.config.temperature) {
            payload["temperature"] = json!(temperature);
        }
        if !conversation.actions.is_empty() {
            payload["tools"] = json!(Self::tools_to_anthropic_spec(&conversation.actions)?);
            if let Some(choice) = &conversation.action_choice {
                payload["tool_choice"] = json!({"type": "tool", "name": choice});
            }
        }

        Ok(payload)
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));
        tracing::debug!(provider = "anthropic", %url, "sending request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(payload)
            .send()
            .await?;

        check_status(response).await
    }

    async fn complete(&self, mut conversation: Conversation) -> Result<Response> {
        let payload = self.payload(&conversation)?;
        conversation.mark_sent();

        let raw: Value = self.send(&payload).await?.json().await?;
        if let Some(error) = raw.get("error") {
            return Err(anyhow!("Anthropic API error: {}", error));
        }

        let message = Self::response_to_message(&raw)?;
        let stop_reason = raw["stop_reason"].as_str().map(String::from);
        let usage = Self::get_usage(&raw);

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

        let response = self.send(&payload).await?;

        let mut message = Message::assistant();
        // tool_use blocks by content index: (id, name, accumulated input json)
        let mut tool_uses: BTreeMap<u64, (Option<String>, String, String)> = BTreeMap::new();
        let mut stop_reason = None;

        for_each_event(response, |_, data| {
            let event: Value = serde_json::from_str(data)?;
            let index = event["index"].as_u64().unwrap_or_default();

            match event["type"].as_str() {
                Some("content_block_start") => {
                    let block = &event["content_block"];
                    if block["type"] == "tool_use" {
                        tool_uses.insert(
                            index,
                            (
                                block["id"].as_str().map(String::from),
                                block["name"].as_str().unwrap_or_default().to_string(),
                                String::new(),
                            ),
                        );
                    }
                }
                Some("content_block_delta") => {
                    let delta = &event["delta"];
                    match delta["type"].as_str() {
                        Some("text_delta") => {
                            let text = delta["text"].as_str().unwrap_or_default();
                            message.append(text);
                            if let Some(sink) = &sink {
                                sink.on_delta(&message, Some(text), false);
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some((_, _, input)) = tool_uses.get_mut(&index) {
                                input.push_str(delta["partial_json"].as_str().unwrap_or_default());
                            }
                        }
                        _ => {}
                    }
                }
                Some("message_delta") => {
                    if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                        stop_reason = Some(reason.to_string());
                    }
                }
                Some("message_stop") => return Ok(false),
                Some("error") => return Err(anyhow!("Anthropic stream error: {}", event["error"])),
                _ => {}
            }

            Ok(true)
        })
        .await?;

        let actions: Vec<Action> = tool_uses
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, input)| Action::new(id, name, decode_arguments(&json!(input))))
            .collect();
        let message = message.with_requested_actions(actions);

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
}

fn is_tool_result_turn(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .map(|block| block["type"] == "tool_result")
            .unwrap_or(false)
}

/// Anthropic takes images either by URL or as inline base64 data
fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            });
        }
    }
    json!({
        "type": "image",
        "source": {"type": "url", "url": url}
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
}
