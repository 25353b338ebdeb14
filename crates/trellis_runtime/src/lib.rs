//! Trellis Runtime
//!
//! Drives a run from merged configuration to requested outputs: builds
//! or reuses the graph, resolves the plan, dispatches ready nodes through
//! an executor backend with per-node retry, reuses cached results and
//! fires lifecycle callbacks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod callback;
pub mod cluster;
pub mod codec;
pub mod engine;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod pool;
pub mod retry;
pub mod scheduler;

pub use cache::{CacheSlot, ResultCache};
pub use callback::{Bound, CallbackRegistry, FailureCallback, SuccessCallback};
pub use cluster::{Cluster, LocalCluster, RemoteRequest, RemoteResponse, RemoteScheduler, TransportError};
pub use engine::{RunEnvironment, RunOrchestrator, RunResult, RunState, RunStatus};
pub use error::RunError;
pub use executor::{ExecutorAdapter, ExecutorFactory, NodeOutcome, NodeTask, Synchronous};
pub use pipeline::{PipelineRunner, RunRequest};
pub use pool::{ProcessPool, ThreadPool};
pub use retry::{AttemptError, Attempted, RetryPolicy, execute_with_retry};
pub use scheduler::{ScheduleError, Scheduler};
