use anyhow::Result;
use actionprompt::{
    agent::{Agent, PromptOptions},
    errors::{AgentError, ErrorKind},
    models::{role::Role, tool::Tool},
    providers::{
        configs::{OpenAiProviderConfig, ProviderConfig, ProviderRegistry},
        factory::get_provider,
    },
    queue::{AgentRegistry, InMemoryQueue, JobOptions},
};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CAT_IMAGE_URL: &str = "https://cataas.com/cat/says/hello";
const INSTRUCTIONS: &str =
    "You're a support agent. Your job is to help users with their questions.";

fn completion(message: Value, finish_reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
        "usage": {"prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30}
    }))
}

fn cat_agent(server: &MockServer) -> Result<Agent> {
    let config = OpenAiProviderConfig::openai("test_api_key")
        .with_host(format!("{}/v1", server.uri()))
        .with_model("gpt-4o-mini");

    Ok(Agent::new("support_agent")
        .with_instructions(INSTRUCTIONS)
        .generate_with(get_provider(ProviderConfig::OpenAi(config))?)
        .action(
            Tool::without_parameters("prompt_context", "Answer the user's question"),
            |ctx| {
                let message = ctx
                    .param("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                ctx.prompt(PromptOptions::new().with_message(message))?;
                Ok(())
            },
        )
        .action(
            Tool::new(
                "get_cat_image",
                "Fetch a random cat picture",
                json!({"type": "object", "properties": {}}),
            ),
            |ctx| {
                ctx.prompt(PromptOptions::new().with_message(CAT_IMAGE_URL))?;
                Ok(())
            },
        ))
}

fn params(message: &str) -> serde_json::Map<String, Value> {
    let mut params = serde_json::Map::new();
    params.insert("message".to_string(), json!(message));
    params
}

#[tokio::test]
async fn test_generation_without_actions() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(completion(
            json!({"role": "assistant", "content": "Hello! How can I help you today?"}),
            "stop",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let agent = cat_agent(&server)?;
    let response = agent
        .with(params("Hi, I'm Justin"))
        .generation("prompt_context", json!({}))
        .run_now_strict()
        .await?;

    let roles: Vec<Role> = response.conversation.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert_eq!(response.conversation.messages()[0].content, INSTRUCTIONS);
    assert_eq!(response.conversation.messages()[1].content, "Hi, I'm Justin");
    assert_eq!(response.message().unwrap().content, "Hello! How can I help you today?");
    assert_eq!(response.usage.as_ref().and_then(|u| u.total_tokens), Some(30));
    Ok(())
}

#[tokio::test]
async fn test_generation_with_requested_action() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system"},
                {"role": "user", "content": "Show me a cat"}
            ]
        })))
        .respond_with(completion(
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_cat",
                    "type": "function",
                    "function": {"name": "get_cat_image", "arguments": "{}"}
                }]
            }),
            "tool_calls",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let agent = cat_agent(&server)?;
    let response = agent
        .with(params("Show me a cat"))
        .generation("prompt_context", json!({}))
        .run_now_strict()
        .await?;

    let messages = response.conversation.messages();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);

    assert!(messages[2].is_action_requested());
    assert_eq!(messages[2].requested_actions[0].name, "get_cat_image");
    assert_eq!(messages[3].content, CAT_IMAGE_URL);
    assert_eq!(messages[3].action_id.as_deref(), Some("call_cat"));
    assert_eq!(messages[3].name.as_deref(), Some("get_cat_image"));

    let requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body)?;
    let tool_names: Vec<&str> = sent["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["function"]["name"].as_str())
        .collect();
    assert_eq!(tool_names, vec!["get_cat_image", "prompt_context"]);
    Ok(())
}

#[tokio::test]
async fn test_streamed_text_and_tool_call_are_performed() -> Result<()> {
    let chunks = [
        json!({"choices": [{"delta": {"role": "assistant", "content": "Let me check."}}]}),
        json!({"choices": [{"delta": {"tool_calls": [{
            "id": "call_cat",
            "type": "function",
            "function": {"name": "get_cat_image", "arguments": "{}"}
        }]}}]}),
        json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
    ];
    let mut body: String = chunks.iter().map(|c| format!("data: {}\n\n", c)).collect();
    body.push_str("data: [DONE]\n\n");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = OpenAiProviderConfig::openai("test_api_key")
        .with_host(format!("{}/v1", server.uri()))
        .with_stream(true);
    let agent = cat_agent(&server)?.generate_with(get_provider(ProviderConfig::OpenAi(config))?);
    let response = agent
        .with(params("Show me a cat"))
        .generation("prompt_context", json!({}))
        .run_now_strict()
        .await?;

    let messages = response.conversation.messages();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
    assert_eq!(messages[2].content, "Let me check.");
    assert!(messages[2].is_action_requested());
    assert_eq!(messages[3].content, CAT_IMAGE_URL);
    assert_eq!(messages[3].action_id.as_deref(), Some("call_cat"));
    Ok(())
}

#[tokio::test]
async fn test_follow_up_round_sends_tool_result() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [{}, {}, {}, {"role": "tool", "tool_call_id": "call_cat"}]
        })))
        .respond_with(completion(
            json!({"role": "assistant", "content": "Here is a cat for you."}),
            "stop",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(completion(
            json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": "call_cat",
                    "type": "function",
                    "function": {"name": "get_cat_image", "arguments": ""}
                }]
            }),
            "tool_calls",
        ))
        .mount(&server)
        .await;

    let agent = cat_agent(&server)?.with_max_rounds(2);
    let response = agent
        .with(params("Show me a cat"))
        .generation("prompt_context", json!({}))
        .run_now_strict()
        .await?;

    assert_eq!(response.conversation.messages().len(), 5);
    assert_eq!(response.message().unwrap().content, "Here is a cat for you.");
    Ok(())
}

#[tokio::test]
async fn test_provider_failure_is_rescued() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let agent = cat_agent(&server)?;
    let err = agent
        .with(params("hello"))
        .generation("prompt_context", json!({}))
        .run_now_strict()
        .await
        .unwrap_err();
    assert_eq!(err, AgentError::Provider("Server error: 503 Service Unavailable".to_string()));

    let rescued = agent
        .rescue_from(ErrorKind::Provider, |_| Ok(()))
        .with(params("hello"))
        .generation("prompt_context", json!({}))
        .run_now()
        .await?;
    assert!(rescued.is_none());
    Ok(())
}

#[tokio::test]
async fn test_deferred_generation_runs_on_worker() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(completion(json!({"role": "assistant", "content": "Later!"}), "stop"))
        .expect(1)
        .mount(&server)
        .await;

    let queue = Arc::new(InMemoryQueue::new());
    let agent = cat_agent(&server)?.with_queue(queue.clone());

    let job = agent
        .with(params("see you"))
        .generation("prompt_context", json!({}))
        .run_later(JobOptions::default().with_queue("low_priority"))
        .await?
        .unwrap();
    assert_eq!(job.params["message"], "see you");

    let mut registry = AgentRegistry::new();
    registry.register(agent);
    let mut results = queue.perform_all(&registry).await;
    let response = results.remove(0)?.unwrap();
    assert_eq!(response.message().unwrap().content, "Later!");
    Ok(())
}

#[tokio::test]
async fn test_agent_from_installed_registry() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "llama3.2"})))
        .respond_with(completion(json!({"role": "assistant", "content": "local hi"}), "stop"))
        .expect(1)
        .mount(&server)
        .await;

    let document = format!(
        "test:\n  local:\n    service: Ollama\n    host: {}/v1\n    model: llama3.2\n",
        server.uri()
    );
    ProviderRegistry::from_yaml_str(&document, Some("test"))?.install()?;

    let agent = Agent::new("local_agent")
        .generate_with_named("local")?
        .action(Tool::without_parameters("say_hi", "Say hi"), |ctx| {
            ctx.prompt(PromptOptions::new().with_message("hi"))?;
            Ok(())
        });

    let response = agent.generation("say_hi", json!({})).run_now_strict().await?;
    assert_eq!(response.message().unwrap().content, "local hi");
    Ok(())
}
