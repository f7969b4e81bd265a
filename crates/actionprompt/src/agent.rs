use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::errors::{AgentError, AgentResult, ErrorKind};
use crate::generation::Generation;
use crate::models::conversation::{Conversation, GenerationOptions, DEFAULT_CHARSET};
use crate::models::message::{Message, DEFAULT_CONTENT_TYPE};
use crate::models::tool::Tool;
use crate::providers::base::{Provider, Response};
use crate::providers::configs::ProviderRegistry;
use crate::queue::GenerationQueue;

/// Default number of generate-then-act rounds per run
pub const DEFAULT_MAX_ROUNDS: usize = 1;

pub type ActionHandler = Arc<dyn Fn(&mut AgentContext<'_>) -> AgentResult<()> + Send + Sync>;
pub type BeforeGeneration = Arc<dyn Fn(&Conversation) + Send + Sync>;
pub type AfterGeneration = Arc<dyn Fn(&Response) + Send + Sync>;

/// Returns `Ok(())` when the error was handled, or an error to propagate
pub type RescueHandler = Arc<dyn Fn(&AgentError) -> AgentResult<()> + Send + Sync>;

#[derive(Clone)]
struct RegisteredAction {
    tool: Tool,
    handler: ActionHandler,
}

/// Error handlers keyed by error kind
#[derive(Clone, Default)]
pub struct RescueRegistry {
    handlers: HashMap<ErrorKind, RescueHandler>,
}

impl RescueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rescue_from<F>(&mut self, kind: ErrorKind, handler: F)
    where
        F: Fn(&AgentError) -> AgentResult<()> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn handles(&self, kind: ErrorKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the handler for `error`, handing the error back when none is registered
    pub fn handle(&self, error: AgentError) -> AgentResult<()> {
        match self.handlers.get(&error.kind()) {
            Some(handler) => {
                tracing::debug!(kind = error.kind().as_ref(), "rescuing generation error");
                handler(&error)
            }
            None => Err(error),
        }
    }
}

/// How a prompt is composed from inside an action handler
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    pub instructions: Option<String>,
    /// Plain body used when no rendered parts are given
    pub message: Option<String>,
    /// Prior turns placed before the new message
    pub messages: Vec<Message>,
    /// Already rendered `(body, content_type)` fragments
    pub parts: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub actions: Option<Vec<Tool>>,
    pub action_choice: Option<String>,
    pub options: GenerationOptions,
    pub context_id: Option<String>,
}

impl PromptOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instructions<S: Into<String>>(mut self, instructions: S) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_part<B, C>(mut self, body: B, content_type: C) -> Self
    where
        B: Into<String>,
        C: Into<String>,
    {
        self.parts.push((body.into(), content_type.into()));
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<Tool>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_action_choice<S: Into<String>>(mut self, name: S) -> Self {
        self.action_choice = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context_id<S: Into<String>>(mut self, context_id: S) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

/// An agent definition: the actions it can run and how it generates.
///
/// Cloning is cheap; handlers, callbacks, the provider and the queue are
/// shared.
#[derive(Clone)]
pub struct Agent {
    name: String,
    provider: Option<Arc<dyn Provider>>,
    options: GenerationOptions,
    instructions: Option<String>,
    content_type: String,
    charset: String,
    actions: BTreeMap<String, RegisteredAction>,
    before_generation: Vec<BeforeGeneration>,
    after_generation: Vec<AfterGeneration>,
    rescue: RescueRegistry,
    queue: Option<Arc<dyn GenerationQueue>>,
    max_rounds: usize,
    params: Map<String, Value>,
}

impl Agent {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            provider: None,
            options: GenerationOptions::default(),
            instructions: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            charset: DEFAULT_CHARSET.to_string(),
            actions: BTreeMap::new(),
            before_generation: Vec::new(),
            after_generation: Vec::new(),
            rescue: RescueRegistry::new(),
            queue: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            params: Map::new(),
        }
    }

    pub fn generate_with(mut self, provider: Box<dyn Provider>) -> Self {
        self.provider = Some(Arc::from(provider));
        self
    }

    /// Use the provider registered as `name` in the installed registry,
    /// applying this agent's generation options as overrides
    pub fn generate_with_named(self, name: &str) -> AgentResult<Self> {
        let registry = ProviderRegistry::global().ok_or_else(|| {
            AgentError::Config("no provider registry has been installed".to_string())
        })?;
        let provider = registry.provider(name, &self.options)?;
        Ok(self.generate_with(provider))
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_instructions<S: Into<String>>(mut self, instructions: S) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_charset<S: Into<String>>(mut self, charset: S) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn GenerationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Register an action; `tool` is the schema offered to the model
    pub fn action<F>(mut self, tool: Tool, handler: F) -> Self
    where
        F: Fn(&mut AgentContext<'_>) -> AgentResult<()> + Send + Sync + 'static,
    {
        self.actions.insert(
            tool.name.clone(),
            RegisteredAction {
                tool,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn before_generation<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Conversation) + Send + Sync + 'static,
    {
        self.before_generation.push(Arc::new(callback));
        self
    }

    pub fn after_generation<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.after_generation.push(Arc::new(callback));
        self
    }

    pub fn rescue_from<F>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(&AgentError) -> AgentResult<()> + Send + Sync + 'static,
    {
        self.rescue.rescue_from(kind, handler);
        self
    }

    /// A copy of this agent carrying `params` into every action it processes
    pub fn with(&self, params: Map<String, Value>) -> Agent {
        let mut agent = self.clone();
        agent.params.extend(params);
        agent
    }

    /// Prepare a generation of `action` without running anything yet
    pub fn generation<S: Into<String>>(&self, action: S, args: Value) -> Generation {
        Generation::new(self.clone(), action, args)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> AgentResult<&dyn Provider> {
        self.provider.as_deref().ok_or_else(|| {
            AgentError::Config(format!(
                "no generation provider configured for agent {}",
                self.name
            ))
        })
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    pub fn queue(&self) -> Option<&Arc<dyn GenerationQueue>> {
        self.queue.as_ref()
    }

    pub fn rescue(&self) -> &RescueRegistry {
        &self.rescue
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Tool schemas for every registered action
    pub fn tools(&self) -> Vec<Tool> {
        self.actions.values().map(|a| a.tool.clone()).collect()
    }

    pub(crate) fn notify_before(&self, conversation: &Conversation) {
        for callback in &self.before_generation {
            callback(conversation);
        }
    }

    pub(crate) fn notify_after(&self, response: &Response) {
        for callback in &self.after_generation {
            callback(response);
        }
    }

    /// Run the handler for `action` on a fresh context and return that context
    pub fn process(
        &self,
        action: &str,
        args: Value,
        params: Map<String, Value>,
    ) -> AgentResult<AgentContext<'_>> {
        let span = tracing::info_span!("process", agent = %self.name, action = %action);
        let _enter = span.enter();

        let registered = self
            .actions
            .get(action)
            .ok_or_else(|| AgentError::ActionNotFound(action.to_string()))?;

        let mut merged = self.params.clone();
        merged.extend(params);

        let mut context = AgentContext::new(self, action, args, merged);
        (registered.handler)(&mut context)?;
        tracing::debug!(prompted = context.prompted, "action processed");
        Ok(context)
    }
}

/// What an action handler works with: its arguments and the conversation
/// it is composing
pub struct AgentContext<'a> {
    agent: &'a Agent,
    action_name: String,
    args: Value,
    params: Map<String, Value>,
    conversation: Conversation,
    prompted: bool,
}

impl<'a> AgentContext<'a> {
    fn new(agent: &'a Agent, action_name: &str, args: Value, params: Map<String, Value>) -> Self {
        Self {
            conversation: Self::fresh_conversation(agent),
            agent,
            action_name: action_name.to_string(),
            args,
            params,
            prompted: false,
        }
    }

    fn fresh_conversation(agent: &Agent) -> Conversation {
        let mut conversation = Conversation::new()
            .with_content_type(agent.content_type.clone())
            .with_options(agent.options.clone());
        conversation.charset = agent.charset.clone();
        if let Some(instructions) = &agent.instructions {
            conversation.set_instructions(instructions.clone());
        }
        conversation
    }

    pub fn agent(&self) -> &Agent {
        self.agent
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    pub fn is_prompted(&self) -> bool {
        self.prompted
    }

    /// Compose the conversation for this action
    pub fn prompt(&mut self, options: PromptOptions) -> AgentResult<&mut Conversation> {
        let conversation = &mut self.conversation;

        if let Some(instructions) = options.instructions {
            conversation.set_instructions(instructions);
        }
        if let Some(content_type) = options.content_type {
            conversation.content_type = content_type;
        }
        if !options.messages.is_empty() {
            conversation.set_messages(options.messages);
        }

        if !options.parts.is_empty() {
            for (body, content_type) in options.parts {
                conversation.add_part(
                    Message::user()
                        .with_text(body)
                        .with_content_type(content_type),
                );
            }
        } else if let Some(body) = options.message {
            let content_type = conversation.content_type.clone();
            conversation.add_part(Message::user().with_text(body).with_content_type(content_type));
        }

        conversation.actions = options.actions.unwrap_or_else(|| self.agent.tools());
        if let Some(choice) = options.action_choice {
            if !conversation.actions.iter().any(|tool| tool.name == choice) {
                return Err(AgentError::ActionNotFound(choice));
            }
            conversation.action_choice = Some(choice);
        }
        conversation.options = self.agent.options.merge(&options.options);
        conversation.params = self.params.clone();
        if options.context_id.is_some() {
            conversation.context_id = options.context_id;
        }

        self.prompted = true;
        Ok(conversation)
    }

    /// The composed conversation, or one carrying only the instructions when
    /// the handler never prompted
    pub fn into_conversation(self) -> Conversation {
        if self.prompted {
            self.conversation
        } else {
            Self::fresh_conversation(self.agent)
        }
    }
}
