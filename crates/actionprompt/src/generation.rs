use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::agent::Agent;
use crate::errors::{AgentError, AgentResult};
use crate::models::action::Action;
use crate::models::conversation::Conversation;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::providers::base::Response;
use crate::queue::{GenerationJob, GenerationMethod, JobOptions};

/// A pending generation of one agent action.
///
/// Nothing runs until one of the `run_*` methods is called. The conversation
/// is built at most once, the first time it is needed.
pub struct Generation {
    agent: Agent,
    action_name: String,
    args: Value,
    conversation: Option<Conversation>,
}

impl Generation {
    pub fn new<S: Into<String>>(agent: Agent, action_name: S, args: Value) -> Self {
        Self {
            agent,
            action_name: action_name.into(),
            args,
            conversation: None,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Whether the conversation has been built already
    pub fn is_processed(&self) -> bool {
        self.conversation.is_some()
    }

    /// The conversation for this action, processing the agent on first access
    pub fn conversation(&mut self) -> AgentResult<&mut Conversation> {
        let conversation = match self.conversation.take() {
            Some(conversation) => conversation,
            None => self.process()?,
        };
        Ok(self.conversation.insert(conversation))
    }

    fn process(&self) -> AgentResult<Conversation> {
        let context = self
            .agent
            .process(&self.action_name, self.args.clone(), Map::new())?;
        Ok(context.into_conversation())
    }

    /// Generate and resolve requested actions; failures go through the
    /// agent's rescue handlers and `Ok(None)` means one handled it
    pub async fn run_now(self) -> AgentResult<Option<Response>> {
        let rescue = self.agent.rescue().clone();
        match self.run_now_strict().await {
            Ok(response) => Ok(Some(response)),
            Err(error) => rescue.handle(error).map(|()| None),
        }
    }

    /// Generate and resolve requested actions, propagating every failure
    pub async fn run_now_strict(mut self) -> AgentResult<Response> {
        let conversation = match self.conversation.take() {
            Some(conversation) => conversation,
            None => self.process()?,
        };
        let agent = &self.agent;
        let provider = agent.provider()?;

        agent.notify_before(&conversation);
        tracing::debug!(
            agent = agent.name(),
            action = %self.action_name,
            provider = provider.name(),
            "generating"
        );
        let mut response = provider.generate(conversation).await?;

        let mut seen = HashSet::new();
        let mut rounds = 0;
        while let Some(requested) = pending_actions(&response) {
            // Repeats only count across rounds
            let keys: Vec<(String, String)> = requested
                .iter()
                .map(|action| (action.name.clone(), action.arguments().to_string()))
                .collect();
            if let Some((name, _)) = keys.iter().find(|key| seen.contains(*key)) {
                return Err(AgentError::RepeatedAction(name.clone()));
            }
            seen.extend(keys);

            response = perform_actions(agent, response)?;
            rounds += 1;
            if rounds >= agent.max_rounds() {
                break;
            }
            response = provider.generate(response.conversation).await?;
        }

        response.conversation.mark_done();
        agent.notify_after(&response);
        Ok(response)
    }

    /// Hand the generation to the agent's queue; failures go through the
    /// rescue handlers
    pub async fn run_later(self, options: JobOptions) -> AgentResult<Option<GenerationJob>> {
        let rescue = self.agent.rescue().clone();
        match self.enqueue(options, GenerationMethod::RunNow).await {
            Ok(job) => Ok(Some(job)),
            Err(error) => rescue.handle(error).map(|()| None),
        }
    }

    pub async fn run_later_strict(self, options: JobOptions) -> AgentResult<GenerationJob> {
        self.enqueue(options, GenerationMethod::RunNowStrict).await
    }

    async fn enqueue(
        self,
        options: JobOptions,
        method: GenerationMethod,
    ) -> AgentResult<GenerationJob> {
        // Only the action arguments travel with the job
        if self.is_processed() {
            return Err(AgentError::PromptAccessed);
        }

        let queue = self
            .agent
            .queue()
            .ok_or_else(|| AgentError::QueueUnavailable(self.agent.name().to_string()))?;

        let job = GenerationJob::new(
            self.agent.name(),
            self.action_name,
            self.args,
            self.agent.params().clone(),
            method,
        );
        queue.enqueue(job.clone(), &options).await?;
        tracing::info!(
            job_id = %job.job_id,
            agent = %job.agent_class_name,
            action = %job.action_name,
            queue = options.queue.as_deref().unwrap_or("default"),
            "enqueued generation"
        );
        Ok(job)
    }
}

/// Actions the latest assistant turn asked for, if any
fn pending_actions(response: &Response) -> Option<Vec<Action>> {
    response
        .message()
        .filter(|message| message.role == Role::Assistant && message.is_action_requested())
        .map(|message| message.requested_actions.clone())
}

/// Run every action requested by the response's message and append each
/// result as a tool turn.
///
/// Actions run in order; each one sees the conversation including the
/// results before it. The first failure stops the loop.
pub fn perform_actions(agent: &Agent, response: Response) -> AgentResult<Response> {
    let requested = pending_actions(&response).unwrap_or_default();
    let stop_reason = response.stop_reason.clone();
    let usage = response.usage.clone();
    let raw = response.raw.clone();
    let mut conversation = response.conversation;

    for action in requested {
        let mut checkpoint = conversation.clone();
        let produced = action.perform_locally(agent, &conversation.params)?;

        let mut message = produced.message().cloned().unwrap_or_else(Message::tool);
        message.role = Role::Tool;
        message.action_id = action.id.clone();
        message.name = Some(action.name.clone());

        tracing::debug!(action = %action.name, "action resolved");
        checkpoint.push(message);
        conversation = checkpoint;
    }

    let mut response = Response::new(conversation).with_stop_reason(stop_reason);
    if let Some(usage) = usage {
        response = response.with_usage(usage);
    }
    if let Some(raw) = raw {
        response = response.with_raw(raw);
    }
    Ok(response)
}
