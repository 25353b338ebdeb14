//! Run orchestration.
//!
//! A [`RunOrchestrator`] drives one run through
//! `Pending -> Configured -> GraphReady -> Running -> {Succeeded, Failed}`
//! and is consumed by it.

use crate::cache::ResultCache;
use crate::callback::{Bound, CallbackRegistry, FailureCallback, SuccessCallback};
use crate::error::RunError;
use crate::executor::{ExecutorFactory, NodeOutcome, NodeTask};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};
use trellis_config::{CachePolicy, ConfigError, ConfigLayer, RunConfig, merge};
use trellis_core::{NodeValue, RunId};
use trellis_plan::{ExecutionPlan, GraphCache, NodeModule, PlanWarning, resolve};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Created, nothing done yet
    Pending,
    /// Configuration merged and validated
    Configured,
    /// Graph built and plan resolved
    GraphReady,
    /// Nodes are executing
    Running,
    /// Every requested output was produced
    Succeeded,
    /// The run ended with an error
    Failed,
}

impl RunState {
    /// Whether the state is final
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Configured => "CONFIGURED",
            Self::GraphReady => "GRAPH_READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Outcome class of a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Nothing failed
    Succeeded,
    /// Outputs were produced but some unrelated nodes failed
    PartialFailure,
}

/// Outputs and bookkeeping of a finished run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run identifier
    pub run_id: RunId,
    /// Requested outputs, in request order
    pub outputs: IndexMap<String, NodeValue>,
    /// Outcome class
    pub status: RunStatus,
    /// Nodes that needed more than one attempt, with their attempt counts
    pub retried: IndexMap<String, u32>,
    /// Failures that did not affect a requested output
    pub failures: Vec<RunError>,
    /// Plan diagnostics
    pub warnings: Vec<PlanWarning>,
    /// Nodes satisfied from the result cache
    pub reused: Vec<String>,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Elapsed time
    pub duration: Duration,
}

impl RunResult {
    /// Look up one output
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NodeValue> {
        self.outputs.get(name)
    }
}

/// Everything a run reads besides its configuration layers
#[derive(Clone, Default)]
pub struct RunEnvironment {
    /// Modules composing the pipeline, in composition order
    pub application: Vec<Arc<NodeModule>>,
    /// Modules runs may add through `additional_modules`
    pub library: IndexMap<String, Arc<NodeModule>>,
    /// Pipeline params read by parameterization
    pub params: Map<String, Value>,
    /// Callbacks runs may reference
    pub callbacks: Arc<CallbackRegistry>,
    /// Backend construction
    pub executors: Arc<ExecutorFactory>,
    /// Built graphs
    pub graphs: Arc<GraphCache>,
    /// Node results
    pub results: Arc<ResultCache>,
}

impl fmt::Debug for RunEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let application: Vec<&str> = self.application.iter().map(|m| m.name.as_str()).collect();
        f.debug_struct("RunEnvironment")
            .field("application", &application)
            .field("library", &self.library.keys().collect::<Vec<_>>())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

struct Configured {
    config: RunConfig,
    modules: Vec<Arc<NodeModule>>,
    literals: IndexMap<String, NodeValue>,
}

/// Drives a single run
pub struct RunOrchestrator {
    run_id: RunId,
    state: RunState,
    env: RunEnvironment,
    layers: Vec<ConfigLayer>,
    values: IndexMap<String, NodeValue>,
    cancel: CancellationToken,
    log_level: Option<Level>,
    on_success: Option<Bound<SuccessCallback>>,
    on_failure: Option<Bound<FailureCallback>>,
}

impl RunOrchestrator {
    /// Create an orchestrator over configuration layers
    #[must_use]
    pub fn new(env: RunEnvironment, layers: Vec<ConfigLayer>) -> Self {
        Self {
            run_id: RunId::new(),
            state: RunState::Pending,
            env,
            layers,
            values: IndexMap::new(),
            cancel: CancellationToken::new(),
            log_level: None,
            on_success: None,
            on_failure: None,
        }
    }

    /// Supply in-process literal inputs; they take precedence over
    /// configured `inputs` of the same name
    #[must_use]
    pub fn with_values(mut self, values: IndexMap<String, NodeValue>) -> Self {
        self.values = values;
        self
    }

    /// Observe a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run identifier
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Drive the run to a terminal state.
    ///
    /// The success callback fires before a result is returned; the failure
    /// callback fires before an error is returned, once callbacks have been
    /// resolved.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error
    pub async fn run(mut self) -> Result<RunResult, RunError> {
        let span = tracing::info_span!("run", run_id = %self.run_id);
        let outcome = self.drive().instrument(span.clone()).await;
        let _entered = span.enter();

        match &outcome {
            Ok(result) => {
                self.transition(RunState::Succeeded);
                if let Some(callback) = &self.on_success {
                    callback.fire(result);
                }
            }
            Err(error) => {
                self.transition(RunState::Failed);
                if self.emits(Level::WARN) {
                    tracing::warn!(error = %error, "Run failed");
                }
                if let Some(callback) = &self.on_failure {
                    callback.fire(error);
                }
            }
        }
        outcome
    }

    async fn drive(&mut self) -> Result<RunResult, RunError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let configured = self.configure()?;
        let plan = self.prepare(&configured)?;
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        self.execute(&configured, &plan, started_at, clock).await
    }

    fn transition(&mut self, next: RunState) {
        if self.state.is_terminal() {
            return;
        }
        if self.emits(Level::DEBUG) {
            tracing::debug!(from = %self.state, to = %next, "Run state transition");
        }
        self.state = next;
    }

    /// Whether events at `level` pass the run's configured log level
    fn emits(&self, level: Level) -> bool {
        self.log_level.is_none_or(|max| level <= max)
    }

    fn configure(&mut self) -> Result<Configured, RunError> {
        let effective = merge(self.layers.clone());
        let config = effective.into_run_config()?;
        self.log_level = config.log_level;

        self.on_success = config
            .on_success
            .as_ref()
            .map(|spec| self.env.callbacks.resolve_success(spec))
            .transpose()?;
        self.on_failure = config
            .on_failure
            .as_ref()
            .map(|spec| self.env.callbacks.resolve_failure(spec))
            .transpose()?;

        // additional modules first so application nodes shadow them
        let mut modules = Vec::with_capacity(config.additional_modules.len() + self.env.application.len());
        for name in &config.additional_modules {
            let module = self
                .env
                .library
                .get(name)
                .ok_or_else(|| ConfigError::UnknownModule(name.clone()))?;
            modules.push(Arc::clone(module));
        }
        modules.extend(self.env.application.iter().cloned());

        let mut literals: IndexMap<String, NodeValue> = config
            .inputs
            .iter()
            .map(|(name, value)| (name.clone(), NodeValue::Data(value.clone())))
            .collect();
        for (name, value) in &self.values {
            literals.insert(name.clone(), value.clone());
        }

        self.transition(RunState::Configured);
        Ok(Configured {
            config,
            modules,
            literals,
        })
    }

    fn prepare(&mut self, configured: &Configured) -> Result<ExecutionPlan, RunError> {
        let Configured {
            config,
            modules,
            literals,
        } = configured;
        let graph = self
            .env
            .graphs
            .get_or_build(modules, &config.config, &self.env.params, config.reload)?;
        let names: IndexSet<String> = literals.keys().cloned().collect();
        let plan = resolve(&graph, &config.final_vars, &names)?;

        if self.emits(Level::DEBUG) {
            tracing::debug!(
                graph = %graph.key,
                nodes = graph.node_count(),
                planned = plan.len(),
                "Graph ready"
            );
        }
        self.transition(RunState::GraphReady);
        Ok(plan)
    }

    async fn execute(
        &mut self,
        configured: &Configured,
        plan: &ExecutionPlan,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> Result<RunResult, RunError> {
        let Configured {
            config, literals, ..
        } = configured;

        // Cancelled when this returns, stopping nodes still queued on the executor
        let dispatch = self.cancel.child_token();
        let _stop_dispatch = dispatch.clone().drop_guard();

        let used: IndexMap<String, NodeValue> = literals
            .iter()
            .filter(|(name, _)| plan.literals.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let identity = ResultCache::identity(&plan.graph.key, &used);
        let mut values = used;

        // Reuse cached values, except for recomputed nodes and their descendants
        let recompute: IndexSet<&str> = match &config.cache {
            CachePolicy::Disabled => IndexSet::new(),
            CachePolicy::Enabled { recompute } => plan.descendants(
                recompute
                    .iter()
                    .map(String::as_str)
                    .filter(|name| plan.upstream.contains_key(*name)),
            ),
        };
        let mut reused = Vec::new();
        if config.cache.is_enabled() {
            for name in &plan.order {
                if recompute.contains(name.as_str()) {
                    continue;
                }
                if let Some(value) = self.env.results.peek(&identity, name) {
                    values.insert(name.clone(), value);
                    reused.push(name.clone());
                }
            }
        }

        let needed = needed_nodes(plan, &values);
        let mut scheduler = Scheduler::new();
        for (index, name) in plan.order.iter().enumerate() {
            if !needed.contains(name.as_str()) {
                continue;
            }
            let deps: IndexSet<String> = plan
                .upstream
                .get(name)
                .into_iter()
                .flatten()
                .filter(|dep| needed.contains(dep.as_str()))
                .cloned()
                .collect();
            scheduler
                .add_node(name.clone(), index, deps)
                .map_err(|e| RunError::Runtime(e.to_string()))?;
        }

        let executor = self.env.executors.build(&config.executor)?;
        let policy = Arc::new(RetryPolicy::from(&config.retry));
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeOutcome>();
        let mut retried = IndexMap::new();
        let mut failures = Vec::new();

        self.transition(RunState::Running);
        if self.emits(Level::DEBUG) {
            tracing::debug!(
                executor = %executor.kind(),
                scheduled = needed.len(),
                reused = reused.len(),
                "Dispatching plan"
            );
        }

        loop {
            let batch = scheduler.take_ready();
            if !batch.is_empty() {
                if self.cancel.is_cancelled() {
                    return Err(RunError::Cancelled);
                }
                let mut tasks = Vec::with_capacity(batch.len());
                for name in batch {
                    tasks.push(self.task(plan, &name, &values, &policy, config, &identity, &recompute)?);
                }
                executor.submit(tasks, tx.clone(), dispatch.clone()).await;
            }
            if scheduler.is_idle() {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RunError::Cancelled),
                outcome = rx.recv() => outcome,
            };
            let Some(NodeOutcome {
                node,
                result,
                attempts,
            }) = outcome
            else {
                break;
            };

            if attempts > 1 {
                retried.insert(node.clone(), attempts);
            }
            match result {
                Ok(value) => {
                    if self.emits(Level::DEBUG) {
                        tracing::debug!(node = %node, attempts, "Node completed");
                    }
                    values.insert(node.clone(), value);
                    scheduler
                        .mark_complete(&node)
                        .map_err(|e| RunError::Runtime(e.to_string()))?;
                }
                Err(error) => {
                    let error = RunError::from_attempt(node.clone(), attempts, error);
                    scheduler
                        .mark_failed(&node)
                        .map_err(|e| RunError::Runtime(e.to_string()))?;
                    if is_critical(plan, &node, &values) {
                        return Err(error);
                    }
                    if self.emits(Level::WARN) {
                        tracing::warn!(node = %node, error = %error, "Node failed; no requested output depends on it");
                    }
                    failures.push(error);
                }
            }
        }

        let mut outputs = IndexMap::with_capacity(plan.final_vars.len());
        for name in &plan.final_vars {
            let value = values
                .get(name)
                .cloned()
                .ok_or_else(|| RunError::Runtime(format!("output '{}' was not produced", name)))?;
            outputs.insert(name.clone(), value);
        }

        Ok(RunResult {
            run_id: self.run_id,
            outputs,
            status: if failures.is_empty() {
                RunStatus::Succeeded
            } else {
                RunStatus::PartialFailure
            },
            retried,
            failures,
            warnings: plan.warnings.clone(),
            reused,
            started_at,
            duration: clock.elapsed(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn task(
        &self,
        plan: &ExecutionPlan,
        name: &str,
        values: &IndexMap<String, NodeValue>,
        policy: &Arc<RetryPolicy>,
        config: &RunConfig,
        identity: &trellis_core::Fingerprint,
        recompute: &IndexSet<&str>,
    ) -> Result<NodeTask, RunError> {
        let node = plan
            .graph
            .node(name)
            .ok_or_else(|| RunError::Runtime(format!("planned node '{}' is not in the graph", name)))?;
        let inputs = node
            .bind(|dep| values.get(dep).cloned())
            .map_err(|e| RunError::from_attempt(name, 0, e.into()))?;

        let slot = match &config.cache {
            CachePolicy::Disabled => None,
            CachePolicy::Enabled { .. } if recompute.contains(name) => {
                Some(self.env.results.fresh_slot(identity, name))
            }
            CachePolicy::Enabled { .. } => Some(self.env.results.slot(identity, name)),
        };
        if self.emits(Level::DEBUG) {
            tracing::debug!(node = %name, "Dispatching node");
        }
        Ok(NodeTask {
            name: name.to_string(),
            func: Arc::clone(&node.func),
            inputs,
            policy: Arc::clone(policy),
            slot,
        })
    }
}

impl fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

/// Computed nodes that must execute: ancestors of the requested outputs,
/// stopping at values already available
fn needed_nodes<'a>(plan: &'a ExecutionPlan, available: &IndexMap<String, NodeValue>) -> IndexSet<&'a str> {
    let mut needed = IndexSet::new();
    let mut stack: Vec<&str> = plan.final_vars.iter().map(String::as_str).collect();
    while let Some(name) = stack.pop() {
        if available.contains_key(name) {
            continue;
        }
        let Some((key, deps)) = plan.upstream.get_key_value(name) else {
            continue;
        };
        if needed.insert(key.as_str()) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    needed
}

/// A failure is critical when a requested output that is still pending
/// is the failed node or depends on it
fn is_critical(plan: &ExecutionPlan, failed: &str, produced: &IndexMap<String, NodeValue>) -> bool {
    plan.final_vars
        .iter()
        .filter(|output| !produced.contains_key(output.as_str()))
        .any(|output| output == failed || plan.ancestors(output).contains(failed))
}
