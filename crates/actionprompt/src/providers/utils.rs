use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::base::Usage;
use crate::models::action::Action;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;

lazy_static! {
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
}

const TOOL_IMAGE_PLACEHOLDER: &str =
    "This tool result included an image that is uploaded in the next message.";

/// Convert internal messages to the OpenAI chat completions message array.
///
/// Tool results that carry an image are sent as a text placeholder followed
/// by a user message holding the image, since the tool role only accepts text.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({ "role": message.role });
        let mut trailing = Vec::new();

        if let Some(name) = message.name.as_deref().filter(|n| !n.is_empty()) {
            if message.role != Role::Tool {
                converted["name"] = json!(sanitize_function_name(name));
            }
        }

        if message.role == Role::Tool {
            if message.is_image() {
                converted["content"] = json!(TOOL_IMAGE_PLACEHOLDER);
                trailing.push(json!({
                    "role": "user",
                    "content": [image_url_part(&message.content)]
                }));
            } else {
                converted["content"] = json!(message.content);
            }
            if let Some(action_id) = message.action_id.as_deref().filter(|id| !id.is_empty()) {
                converted["tool_call_id"] = json!(action_id);
            }
        } else if message.is_image() {
            converted["content"] = json!([image_url_part(&message.content)]);
        } else if !message.content.is_empty() {
            converted["content"] = json!(message.content);
        }

        if message.is_action_requested() {
            let tool_calls: Vec<Value> = message
                .requested_actions
                .iter()
                .map(|action| {
                    let mut call = json!({
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&action.name),
                            "arguments": action.arguments().to_string(),
                        }
                    });
                    if let Some(id) = &action.id {
                        call["id"] = json!(id);
                    }
                    call
                })
                .collect();
            converted["tool_calls"] = json!(tool_calls);
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            messages_spec.push(converted);
        }
        messages_spec.extend(trailing);
    }

    messages_spec
}

fn image_url_part(url: &str) -> Value {
    json!({
        "type": "image_url",
        "image_url": { "url": url }
    })
}

/// Convert the tool catalogue to OpenAI's function tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        }));
    }

    Ok(result)
}

/// Parse the first choice of a chat completion into a message and its finish reason
pub fn openai_response_to_message(response: &Value) -> Result<(Message, Option<String>)> {
    let choice = &response["choices"][0];
    let original = &choice["message"];
    if !original.is_object() {
        return Err(anyhow!(
            "Invalid response format: missing choices[0].message in {}",
            response
        ));
    }

    let stop_reason = choice["finish_reason"].as_str().map(String::from);
    Ok((openai_message(original), stop_reason))
}

/// Build a message from an OpenAI message object or stream delta
pub fn openai_message(original: &Value) -> Message {
    let role = original["role"]
        .as_str()
        .and_then(|role| Role::parse(role).ok())
        .unwrap_or(Role::Assistant);
    let content = original["content"].as_str().unwrap_or_default();

    Message::new(role)
        .with_text(content)
        .with_requested_actions(tool_calls_to_actions(&original["tool_calls"]))
}

/// Convert OpenAI tool call fragments to actions.
///
/// Fragments without a function name are skipped. Arguments arrive as a JSON
/// string; an empty or undecodable string leaves the params absent.
pub fn tool_calls_to_actions(tool_calls: &Value) -> Vec<Action> {
    let Some(tool_calls) = tool_calls.as_array() else {
        return Vec::new();
    };

    tool_calls
        .iter()
        .filter_map(|tool_call| {
            let function = tool_call.get("function")?;
            let name = function["name"].as_str().filter(|n| !n.trim().is_empty());
            let Some(name) = name else {
                tracing::warn!("skipping tool call without a function name");
                return None;
            };
            let id = tool_call["id"].as_str().map(String::from);
            Some(Action::new(id, name, decode_arguments(&function["arguments"])))
        })
        .collect()
}

/// Decode tool arguments, tolerating blank or malformed payloads
pub fn decode_arguments(arguments: &Value) -> Option<Value> {
    match arguments {
        Value::String(raw) if raw.trim().is_empty() => None,
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(params) => Some(params),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "could not decode tool arguments, leaving params empty"
                );
                None
            }
        },
        Value::Null => None,
        other => Some(other.clone()),
    }
}

pub fn openai_usage(data: &Value) -> Option<Usage> {
    let usage = data.get("usage")?;

    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Some(Usage::new(input_tokens, output_tokens, total_tokens))
}

pub fn embedding_from_response(response: &Value) -> Result<Vec<f32>> {
    response["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| anyhow!("Invalid embeddings response: missing data[0].embedding"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("Invalid embedding value: {}", v))
        })
        .collect()
}

/// Turn a non-success HTTP status into an error carrying the body
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        StatusCode::OK => Ok(response),
        status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
            Err(anyhow!("Server error: {}", status))
        }
        status => {
            let error_text = response.text().await.unwrap_or_default();
            if let Ok(body) = serde_json::from_str::<Value>(&error_text) {
                if let Some(err) = check_openai_context_length_error(&body["error"]) {
                    return Err(err.into());
                }
            }
            Err(anyhow!("Request failed: {} - {}", status, error_text))
        }
    }
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENAI_TOOL_USE_RESPONSE: &str = r#"{
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "1",
                    "type": "function",
                    "function": {
                        "name": "lookup",
                        "arguments": "{\"q\": \"cats\"}"
                    }
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 25,
            "total_tokens": 35
        }
    }"#;

    #[test]
    fn test_messages_to_openai_spec() {
        let spec = messages_to_openai_spec(&[Message::user().with_text("Hello")]);
        assert_eq!(spec, vec![json!({"role": "user", "content": "Hello"})]);
    }

    #[test]
    fn test_messages_to_openai_spec_skips_empty_messages() {
        let messages = [Message::user(), Message::assistant().with_text("Hi")];
        let spec = messages_to_openai_spec(&messages);
        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0]["role"], "assistant");
    }

    #[test]
    fn test_messages_to_openai_spec_tool_round() {
        let messages = vec![
            Message::system().with_text("Be helpful"),
            Message::user().with_text("How are you?"),
            Message::assistant().with_requested_actions(vec![Action::new(
                Some("call_1".to_string()),
                "example",
                Some(json!({"param1": "value1"})),
            )]),
            Message::tool()
                .with_text("Result")
                .with_action_id("call_1")
                .with_name("example"),
        ];

        let spec = messages_to_openai_spec(&messages);

        assert_eq!(spec.len(), 4);
        assert_eq!(spec[0]["role"], "system");
        assert_eq!(spec[2]["role"], "assistant");
        assert!(spec[2].get("content").is_none());
        assert_eq!(spec[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(spec[2]["tool_calls"][0]["function"]["name"], "example");
        assert_eq!(
            spec[2]["tool_calls"][0]["function"]["arguments"],
            "{\"param1\":\"value1\"}"
        );
        assert_eq!(spec[3]["role"], "tool");
        assert_eq!(spec[3]["content"], "Result");
        assert_eq!(spec[3]["tool_call_id"], spec[2]["tool_calls"][0]["id"]);
        assert!(spec[3].get("name").is_none());
    }

    #[test]
    fn test_messages_to_openai_spec_images() {
        let messages = vec![
            Message::user().with_image_url("https://example.com/cat.png"),
            Message::tool()
                .with_image_url("data:image/jpeg;base64,AAAA")
                .with_action_id("call_2"),
        ];

        let spec = messages_to_openai_spec(&messages);

        assert_eq!(spec.len(), 3);
        assert_eq!(spec[0]["content"][0]["type"], "image_url");
        assert_eq!(spec[0]["content"][0]["image_url"]["url"], "https://example.com/cat.png");
        assert_eq!(spec[1]["role"], "tool");
        assert_eq!(spec[1]["content"], TOOL_IMAGE_PLACEHOLDER);
        assert_eq!(spec[2]["role"], "user");
        assert_eq!(spec[2]["content"][0]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
    }

    #[test]
    fn test_tools_to_openai_spec() -> Result<()> {
        let tool = Tool::new(
            "test_tool",
            "A test tool",
            json!({
                "type": "object",
                "properties": {"input": {"type": "string"}},
                "required": ["input"]
            }),
        );

        let spec = tools_to_openai_spec(&[tool.clone()])?;
        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0]["type"], "function");
        assert_eq!(spec[0]["function"]["name"], "test_tool");
        assert_eq!(spec[0]["function"]["parameters"], tool.parameters);

        let result = tools_to_openai_spec(&[tool.clone(), tool]);
        assert!(result.unwrap_err().to_string().contains("Duplicate tool name"));
        assert!(tools_to_openai_spec(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_openai_response_to_message_text() -> Result<()> {
        let response = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "Hello from the model"},
                "finish_reason": "stop"
            }]
        });

        let (message, stop_reason) = openai_response_to_message(&response)?;
        assert_eq!(message.content, "Hello from the model");
        assert_eq!(message.role, Role::Assistant);
        assert!(!message.is_action_requested());
        assert_eq!(stop_reason.as_deref(), Some("stop"));
        Ok(())
    }

    #[test]
    fn test_openai_response_to_message_tool_call() -> Result<()> {
        let response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        let (message, stop_reason) = openai_response_to_message(&response)?;

        assert!(message.is_action_requested());
        assert_eq!(message.requested_actions.len(), 1);
        assert_eq!(message.requested_actions[0].name, "lookup");
        assert_eq!(message.requested_actions[0].id.as_deref(), Some("1"));
        assert_eq!(message.requested_actions[0].params, Some(json!({"q": "cats"})));
        assert_eq!(stop_reason.as_deref(), Some("tool_calls"));
        Ok(())
    }

    #[test]
    fn test_openai_response_to_message_malformed_arguments() -> Result<()> {
        let mut response: Value = serde_json::from_str(OPENAI_TOOL_USE_RESPONSE)?;
        response["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"] =
            json!("invalid json {");

        let (message, _) = openai_response_to_message(&response)?;
        assert!(message.is_action_requested());
        assert_eq!(message.requested_actions[0].params, None);
        Ok(())
    }

    #[test]
    fn test_tool_calls_without_name_are_skipped() {
        let actions = tool_calls_to_actions(&json!([
            {"id": "a", "function": {"name": "", "arguments": "{}"}},
            {"id": "b"},
            {"id": "c", "function": {"name": "ok", "arguments": ""}}
        ]));
        assert_eq!(actions, vec![Action::new(Some("c".to_string()), "ok", None)]);
    }

    #[test]
    fn test_missing_message_is_error() {
        let result = openai_response_to_message(&json!({"choices": []}));
        assert!(result.is_err());
    }

    #[test]
    fn test_openai_usage() {
        let usage = openai_usage(&json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4}}));
        assert_eq!(usage, Some(Usage::new(Some(3), Some(4), Some(7))));
        assert_eq!(openai_usage(&json!({})), None);
    }

    #[test]
    fn test_embedding_from_response() -> Result<()> {
        let embedding = embedding_from_response(&json!({"data": [{"embedding": [0.5, -1.0]}]}))?;
        assert_eq!(embedding, vec![0.5, -1.0]);
        assert!(embedding_from_response(&json!({"data": []})).is_err());
        Ok(())
    }

    #[test]
    fn test_sanitize_function_name() {
        assert_eq!(sanitize_function_name("hello-world"), "hello-world");
        assert_eq!(sanitize_function_name("hello world"), "hello_world");
        assert_eq!(sanitize_function_name("hello@world"), "hello_world");
    }

    #[test]
    fn test_check_openai_context_length_error() {
        let error = json!({
            "code": "context_length_exceeded",
            "message": "This message is too long"
        });
        let result = check_openai_context_length_error(&error);
        assert_eq!(
            result.unwrap().to_string(),
            "Context length exceeded. Message: This message is too long"
        );

        let error = json!({"code": "other_error", "message": "Some other error"});
        assert!(check_openai_context_length_error(&error).is_none());
    }
}
