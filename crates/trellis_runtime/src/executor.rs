//! Executor backends.
//!
//! An adapter receives batches of ready nodes and reports one
//! [`NodeOutcome`] per node on the completion channel. Retry and result
//! caching are applied uniformly by [`run_task`]; adapters only decide
//! where a single attempt runs.

use crate::cache::CacheSlot;
use crate::cluster::{Cluster, RemoteScheduler};
use crate::pool::{ProcessPool, ThreadPool};
use crate::retry::{AttemptError, RetryPolicy, execute_with_retry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_config::{ConfigError, ExecutorConfig, ExecutorKind};
use trellis_core::{NodeError, NodeValue};
use trellis_plan::{NodeFn, NodeInputs};

/// Node error classifier for a callable that panicked
pub const PANIC_ERROR: &str = "Panic";

/// One node ready to execute
pub struct NodeTask {
    /// Node name
    pub name: String,
    /// Callable
    pub func: NodeFn,
    /// Bound arguments
    pub inputs: NodeInputs,
    /// Retry policy for this run
    pub policy: Arc<RetryPolicy>,
    /// Result cache cell, when caching is enabled
    pub slot: Option<CacheSlot>,
}

impl std::fmt::Debug for NodeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTask")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("cached", &self.slot.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    /// Node name
    pub node: String,
    /// Value, or the last attempt's error
    pub result: Result<NodeValue, AttemptError>,
    /// Attempts made; zero when the value came from the cache
    pub attempts: u32,
}

/// An execution backend
#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    /// Backend kind
    fn kind(&self) -> ExecutorKind;

    /// Execute `tasks`, sending one outcome per task to `completions`.
    ///
    /// Adapters may return before the tasks finish. Once `cancel` fires,
    /// unfinished tasks are abandoned without an outcome.
    async fn submit(
        &self,
        tasks: Vec<NodeTask>,
        completions: mpsc::UnboundedSender<NodeOutcome>,
        cancel: CancellationToken,
    );
}

/// Call a node callable, turning a panic into a node error
pub(crate) fn invoke(func: &NodeFn, inputs: &NodeInputs) -> Result<NodeValue, NodeError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| func(inputs))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "node panicked".to_string());
            Err(NodeError::new(PANIC_ERROR, message))
        }
    }
}

/// Execute one task with retry, sharing the result through its cache slot.
///
/// `attempt` runs a single invocation wherever the backend places it.
pub(crate) async fn run_task<F, Fut>(task: NodeTask, attempt: F) -> NodeOutcome
where
    F: Fn(NodeFn, NodeInputs) -> Fut,
    Fut: Future<Output = Result<NodeValue, AttemptError>>,
{
    let NodeTask {
        name,
        func,
        inputs,
        policy,
        slot,
    } = task;
    let once = || attempt(Arc::clone(&func), inputs.clone());

    let Some(slot) = slot else {
        let out = execute_with_retry(&policy, &name, once).await;
        return NodeOutcome {
            node: name,
            result: out.result,
            attempts: out.attempts,
        };
    };

    let mut attempts = 0u32;
    let counter = &mut attempts;
    let (policy, node) = (policy.as_ref(), name.as_str());
    let result = slot
        .get_or_try_init(|| async move {
            let out = execute_with_retry(policy, node, once).await;
            *counter = out.attempts;
            out.result
        })
        .await
        .cloned();
    if attempts == 0 {
        tracing::debug!(node = %name, "Reusing cached result");
    }
    NodeOutcome {
        node: name,
        result,
        attempts,
    }
}

/// Executes nodes one at a time on the orchestrating task
#[derive(Debug, Clone, Copy, Default)]
pub struct Synchronous;

#[async_trait]
impl ExecutorAdapter for Synchronous {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Synchronous
    }

    async fn submit(
        &self,
        tasks: Vec<NodeTask>,
        completions: mpsc::UnboundedSender<NodeOutcome>,
        cancel: CancellationToken,
    ) {
        let attempt = |func: NodeFn, inputs: NodeInputs| async move {
            invoke(&func, &inputs).map_err(AttemptError::from)
        };
        for task in tasks {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                outcome = run_task(task, attempt) => outcome,
            };
            if completions.send(outcome).is_err() {
                return;
            }
        }
    }
}

/// Builds the backend a run asks for
#[derive(Default, Clone)]
pub struct ExecutorFactory {
    schedulers: HashMap<ExecutorKind, Arc<dyn RemoteScheduler>>,
}

impl ExecutorFactory {
    /// Create a factory with no distributed schedulers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the scheduler used for a distributed kind
    #[must_use]
    pub fn with_scheduler(mut self, kind: ExecutorKind, scheduler: Arc<dyn RemoteScheduler>) -> Self {
        self.schedulers.insert(kind, scheduler);
        self
    }

    /// Whether a distributed kind can be served
    #[must_use]
    pub fn supports(&self, kind: ExecutorKind) -> bool {
        !kind.is_distributed() || self.schedulers.contains_key(&kind)
    }

    /// Build an adapter
    ///
    /// # Errors
    ///
    /// Returns error if a distributed kind has no registered scheduler, or
    /// `max_workers` is zero
    pub fn build(&self, config: &ExecutorConfig) -> Result<Arc<dyn ExecutorAdapter>, ConfigError> {
        let workers = match config.max_workers {
            Some(0) => return Err(ConfigError::invalid("executor.max_workers", "must be at least 1")),
            Some(n) => n,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };

        let adapter: Arc<dyn ExecutorAdapter> = match config.kind {
            ExecutorKind::Synchronous => Arc::new(Synchronous),
            ExecutorKind::ThreadPool => Arc::new(ThreadPool::new(workers)),
            ExecutorKind::ProcessPool => Arc::new(ProcessPool::new(workers)),
            kind @ (ExecutorKind::Ray | ExecutorKind::Dask) => {
                let scheduler = self
                    .schedulers
                    .get(&kind)
                    .ok_or_else(|| ConfigError::UnsupportedExecutor(kind.to_string()))?;
                Arc::new(Cluster::new(kind, Arc::clone(scheduler), config.num_cpus))
            }
        };
        tracing::debug!(executor = %config.kind, workers, "Executor ready");
        Ok(adapter)
    }
}

impl std::fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.schedulers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ExecutorFactory").field("schedulers", &kinds).finish()
    }
}
