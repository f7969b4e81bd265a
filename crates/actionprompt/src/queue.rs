//! Deferred generations.
//!
//! A [`GenerationJob`] carries only what is needed to rebuild a generation
//! on a worker: the agent name, the action and its arguments. Workers resolve
//! the agent through an [`AgentRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::agent::Agent;
use crate::errors::{AgentError, AgentResult};
use crate::providers::base::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    RunNow,
    RunNowStrict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub agent_class_name: String,
    pub action_name: String,
    pub args: Value,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub generation_method: GenerationMethod,
}

impl GenerationJob {
    pub fn new<A: Into<String>, N: Into<String>>(
        agent_class_name: A,
        action_name: N,
        args: Value,
        params: Map<String, Value>,
        generation_method: GenerationMethod,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            agent_class_name: agent_class_name.into(),
            action_name: action_name.into(),
            args,
            params,
            generation_method,
        }
    }

    /// Rebuild the generation from `registry` and run it with the recorded method
    pub async fn perform(&self, registry: &AgentRegistry) -> AgentResult<Option<Response>> {
        let agent = registry.get(&self.agent_class_name)?;
        tracing::info!(
            job_id = %self.job_id,
            agent = %self.agent_class_name,
            action = %self.action_name,
            "performing generation job"
        );

        let generation = agent
            .with(self.params.clone())
            .generation(self.action_name.clone(), self.args.clone());
        match self.generation_method {
            GenerationMethod::RunNow => generation.run_now().await,
            GenerationMethod::RunNowStrict => generation.run_now_strict().await.map(Some),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub wait: Option<Duration>,
}

impl JobOptions {
    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// Where deferred generations are sent
#[async_trait]
pub trait GenerationQueue: Send + Sync {
    async fn enqueue(&self, job: GenerationJob, options: &JobOptions) -> AgentResult<()>;
}

/// Keeps jobs in memory until they are drained
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: Mutex<Vec<(GenerationJob, JobOptions)>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(GenerationJob, JobOptions)> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every queued job, highest priority first, in
    /// enqueue order within a priority
    pub fn drain(&self) -> Vec<(GenerationJob, JobOptions)> {
        let mut jobs = match self.jobs.lock() {
            Ok(mut jobs) => std::mem::take(&mut *jobs),
            Err(_) => return Vec::new(),
        };
        jobs.sort_by_key(|(_, options)| std::cmp::Reverse(options.priority.unwrap_or_default()));
        jobs
    }

    /// Drain the queue and perform each job in turn
    pub async fn perform_all(
        &self,
        registry: &AgentRegistry,
    ) -> Vec<AgentResult<Option<Response>>> {
        let mut results = Vec::new();
        for (job, _) in self.drain() {
            results.push(job.perform(registry).await);
        }
        results
    }
}

#[async_trait]
impl GenerationQueue for InMemoryQueue {
    async fn enqueue(&self, job: GenerationJob, options: &JobOptions) -> AgentResult<()> {
        self.jobs
            .lock()
            .map_err(|e| AgentError::QueueUnavailable(e.to_string()))?
            .push((job, options.clone()));
        Ok(())
    }
}

/// Agents a worker can rebuild jobs for, by name
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Agent) -> &mut Self {
        self.agents.insert(agent.name().to_string(), Arc::new(agent));
        self
    }

    pub fn get(&self, name: &str) -> AgentResult<Arc<Agent>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::AgentNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }
}
