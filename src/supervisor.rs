use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::callbacks::CallbackSet;
use crate::config::RunnableConfig;
use crate::error::{AgentError, ErrorKind};
use crate::llm::{ChatMessage, LlmClient};
use crate::runnable::{try_invoke_fast, BoxAgent, FastInvoker, Runnable};
use crate::types::{TaskInput, TaskOutput};

/// Name + description pair shown to routers.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name:        String,
    pub description: String,
}

/// A router's verdict: one child, or several for consensus mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Single(String),
    Multi(Vec<String>),
}

/// Chooses which child agent(s) handle a task.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(
        &self,
        ctx: &CancellationToken,
        input: &TaskInput,
        agents: &[AgentInfo],
    ) -> Result<RouteDecision, AgentError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Router implementations
// ─────────────────────────────────────────────────────────────────────────────

/// Asks an LLM to pick a child by name from the catalogue.
pub struct LlmRouter {
    llm: Arc<dyn LlmClient>,
}

impl LlmRouter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Router for LlmRouter {
    async fn route(
        &self,
        ctx: &CancellationToken,
        input: &TaskInput,
        agents: &[AgentInfo],
    ) -> Result<RouteDecision, AgentError> {
        let mut prompt = String::from(
            "Pick the single best agent for the task. Reply with exactly one agent name.\n\nAgents:\n",
        );
        for agent in agents {
            prompt.push_str(&format!("- {}: {}\n", agent.name, agent.description));
        }
        prompt.push_str(&format!("\nTask: {}", input.task));

        let resp = self
            .llm
            .chat(ctx, vec![ChatMessage::user(prompt)])
            .await
            .map_err(|e| {
                AgentError::new(ErrorKind::RoutingFailed, "supervisor", "route", "router LLM failed")
                    .with_source(e)
            })?;

        let reply = resp.content.trim().to_lowercase();
        // Exact match first, containment as fallback for chatty models.
        let chosen = agents
            .iter()
            .find(|a| a.name.to_lowercase() == reply)
            .or_else(|| agents.iter().find(|a| reply.contains(&a.name.to_lowercase())));
        match chosen {
            Some(agent) => Ok(RouteDecision::Single(agent.name.clone())),
            None => Err(AgentError::new(
                ErrorKind::RoutingFailed,
                "supervisor",
                "route",
                format!("router selected unknown agent '{}'", resp.content.trim()),
            )),
        }
    }
}

/// Predicate-based routing with an optional fallback child.
pub struct RuleRouter {
    rules:    Vec<(Box<dyn Fn(&TaskInput) -> bool + Send + Sync>, String)>,
    fallback: Option<String>,
}

impl RuleRouter {
    pub fn new() -> Self {
        Self { rules: Vec::new(), fallback: None }
    }

    pub fn rule(
        mut self,
        predicate: impl Fn(&TaskInput) -> bool + Send + Sync + 'static,
        agent: impl Into<String>,
    ) -> Self {
        self.rules.push((Box::new(predicate), agent.into()));
        self
    }

    /// Route to `agent` when the task contains any of `keywords`
    /// (case-insensitive).
    pub fn keyword_rule(self, keywords: &[&str], agent: impl Into<String>) -> Self {
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        self.rule(
            move |input| {
                let task = input.task.to_lowercase();
                keywords.iter().any(|k| task.contains(k))
            },
            agent,
        )
    }

    pub fn fallback(mut self, agent: impl Into<String>) -> Self {
        self.fallback = Some(agent.into());
        self
    }
}

impl Default for RuleRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for RuleRouter {
    async fn route(
        &self,
        _ctx: &CancellationToken,
        input: &TaskInput,
        _agents: &[AgentInfo],
    ) -> Result<RouteDecision, AgentError> {
        for (predicate, agent) in &self.rules {
            if predicate(input) {
                return Ok(RouteDecision::Single(agent.clone()));
            }
        }
        match &self.fallback {
            Some(agent) => Ok(RouteDecision::Single(agent.clone())),
            None => Err(AgentError::new(
                ErrorKind::RoutingFailed,
                "supervisor",
                "route",
                "no rule matched and no fallback configured",
            )),
        }
    }
}

/// Deterministic rotation over the children in registration order.
#[derive(Default)]
pub struct RoundRobinRouter {
    counter: AtomicUsize,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Router for RoundRobinRouter {
    async fn route(
        &self,
        _ctx: &CancellationToken,
        _input: &TaskInput,
        agents: &[AgentInfo],
    ) -> Result<RouteDecision, AgentError> {
        if agents.is_empty() {
            return Err(AgentError::new(
                ErrorKind::RoutingFailed,
                "supervisor",
                "route",
                "no agents registered",
            ));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(RouteDecision::Single(agents[n % agents.len()].name.clone()))
    }
}

/// Routes every task to all children at once; pair with an aggregation
/// policy for consensus runs.
pub struct BroadcastRouter;

#[async_trait]
impl Router for BroadcastRouter {
    async fn route(
        &self,
        _ctx: &CancellationToken,
        _input: &TaskInput,
        agents: &[AgentInfo],
    ) -> Result<RouteDecision, AgentError> {
        Ok(RouteDecision::Multi(agents.iter().map(|a| a.name.clone()).collect()))
    }
}

/// How a multi-child run folds into one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationPolicy {
    /// First child (in routed order) that succeeded.
    #[default]
    FirstSuccess,
    /// Most frequent successful result wins; ties go to the earliest.
    Majority,
    /// All successful results merged into an array.
    Merge,
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Routes each task to one or several named children.
///
/// Children run via the fast path; the supervisor's own boundary is the
/// observable one. When the router fans out, failed children are recorded in
/// metadata but only an all-fail run fails the supervisor.
pub struct Supervisor {
    name:        String,
    agents:      Vec<(AgentInfo, BoxAgent)>,
    router:      Box<dyn Router>,
    aggregation: AggregationPolicy,
    config:      RunnableConfig,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, router: Box<dyn Router>) -> Self {
        Self {
            name:        name.into(),
            agents:      Vec::new(),
            router,
            aggregation: AggregationPolicy::default(),
            config:      RunnableConfig::new(),
        }
    }

    /// Register a named child. Registration order is the routing catalogue
    /// order.
    pub fn agent(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        agent: BoxAgent,
    ) -> Self {
        self.agents.push((
            AgentInfo { name: name.into(), description: description.into() },
            agent,
        ));
        self
    }

    pub fn aggregation(mut self, policy: AggregationPolicy) -> Self {
        self.aggregation = policy;
        self
    }

    pub fn with_config(mut self, config: RunnableConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn infos(&self) -> Vec<AgentInfo> {
        self.agents.iter().map(|(info, _)| info.clone()).collect()
    }

    fn find(&self, name: &str) -> Option<&BoxAgent> {
        self.agents
            .iter()
            .find(|(info, _)| info.name == name)
            .map(|(_, agent)| agent)
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
        callbacks: &CallbackSet,
    ) -> Result<TaskOutput, AgentError> {
        if let Err(cb_err) = callbacks.start(&input).await {
            callbacks.error(&cb_err).await;
            return Err(cb_err);
        }

        let decision = match self.router.route(ctx, &input, &self.infos()).await {
            Ok(decision) => decision,
            Err(err) => {
                callbacks.error(&err).await;
                return Err(err);
            }
        };

        let result = match decision {
            RouteDecision::Single(name) => self.run_single(ctx, input, &name).await,
            RouteDecision::Multi(names) => self.run_consensus(ctx, input, names).await,
        };

        match result {
            Ok(output) => {
                if let Err(cb_err) = callbacks.agent_finish(&output).await {
                    callbacks.error(&cb_err).await;
                    return Err(cb_err.with_partial_output(output));
                }
                Ok(output)
            }
            Err(err) => {
                callbacks.error(&err).await;
                Err(err)
            }
        }
    }

    async fn run_single(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
        name: &str,
    ) -> Result<TaskOutput, AgentError> {
        let agent = self.find(name).ok_or_else(|| {
            AgentError::new(
                ErrorKind::RoutingFailed,
                "supervisor",
                "invoke",
                format!("routed to unknown agent '{}'", name),
            )
        })?;
        tracing::info!(supervisor = %self.name, sub_agent = %name, "routing task");

        let mut output = try_invoke_fast(agent.as_ref(), ctx, input).await?;
        output
            .metadata
            .insert("sub_agent".to_string(), json!(name));
        output
            .metadata
            .insert("supervisor".to_string(), json!(self.name));
        Ok(output)
    }

    async fn run_consensus(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
        names: Vec<String>,
    ) -> Result<TaskOutput, AgentError> {
        for name in &names {
            if self.find(name).is_none() {
                return Err(AgentError::new(
                    ErrorKind::RoutingFailed,
                    "supervisor",
                    "invoke",
                    format!("routed to unknown agent '{}'", name),
                ));
            }
        }

        let runs = names.iter().map(|name| {
            let agent = self.find(name).expect("validated above");
            let input = input.clone();
            async move { (name.clone(), try_invoke_fast(agent.as_ref(), ctx, input).await) }
        });
        let settled: Vec<(String, Result<TaskOutput, AgentError>)> =
            futures::future::join_all(runs).await;

        let mut successes: Vec<(String, TaskOutput)> = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        for (name, result) in settled {
            match result {
                Ok(output) => successes.push((name, output)),
                Err(err) => failures.push((name, err.to_string())),
            }
        }

        if successes.is_empty() {
            return Err(AgentError::new(
                ErrorKind::ConsensusFailed,
                "supervisor",
                "invoke",
                format!("all {} routed children failed", failures.len()),
            )
            .with_context("children", names.join(",")));
        }

        let mut output = self.aggregate(successes);
        output
            .metadata
            .insert("supervisor".to_string(), json!(self.name));
        if !failures.is_empty() {
            output.metadata.insert(
                "failed_children".to_string(),
                json!(failures
                    .iter()
                    .map(|(name, err)| json!({ "name": name, "error": err }))
                    .collect::<Vec<_>>()),
            );
        }
        Ok(output)
    }

    fn aggregate(&self, mut successes: Vec<(String, TaskOutput)>) -> TaskOutput {
        match self.aggregation {
            AggregationPolicy::FirstSuccess => {
                let (name, mut output) = successes.remove(0);
                output.metadata.insert("sub_agent".to_string(), json!(name));
                output
            }
            AggregationPolicy::Majority => {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for (_, output) in &successes {
                    *counts.entry(output.result_text()).or_insert(0) += 1;
                }
                // Earliest result wins ties.
                let mut winner: Option<(usize, String)> = None;
                for (_, output) in &successes {
                    let text = output.result_text();
                    let votes = counts[&text];
                    if winner.as_ref().map_or(true, |(best, _)| votes > *best) {
                        winner = Some((votes, text));
                    }
                }
                let (votes, winner_text) = winner.expect("non-empty successes");
                let pos = successes
                    .iter()
                    .position(|(_, o)| o.result_text() == winner_text)
                    .expect("winner present");
                let (name, mut output) = successes.swap_remove(pos);
                output.metadata.insert("sub_agent".to_string(), json!(name));
                output.metadata.insert("votes".to_string(), json!(votes));
                output
            }
            AggregationPolicy::Merge => {
                let names: Vec<&str> = successes.iter().map(|(n, _)| n.as_str()).collect();
                let merged: Vec<Value> = successes
                    .iter()
                    .map(|(name, output)| {
                        json!({ "agent": name, "result": output.result })
                    })
                    .collect();
                let mut output = TaskOutput::success(
                    Value::Array(merged),
                    format!("merged {} child results", successes.len()),
                );
                output
                    .metadata
                    .insert("sub_agents".to_string(), json!(names));
                output
            }
        }
    }
}

#[async_trait]
impl Runnable for Supervisor {
    type Input = TaskInput;
    type Output = TaskOutput;

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        let callbacks = CallbackSet::new(self.config.callbacks().to_vec());
        self.run(ctx, input, &callbacks).await
    }

    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn as_fast(&self) -> Option<&dyn FastInvoker<Input = TaskInput, Output = TaskOutput>> {
        Some(self)
    }
}

#[async_trait]
impl FastInvoker for Supervisor {
    async fn invoke_fast(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        self.run(ctx, input, &CallbackSet::empty()).await
    }
}
