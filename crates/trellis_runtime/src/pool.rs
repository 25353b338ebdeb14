//! Bounded worker pools.
//!
//! Both pools cap concurrent attempts with a semaphore and run callables
//! on tokio's blocking pool. The process pool additionally isolates each
//! attempt behind an encode/decode boundary: only portable values get
//! in or out.

use crate::codec;
use crate::executor::{ExecutorAdapter, NodeOutcome, NodeTask, invoke, run_task};
use crate::retry::AttemptError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use trellis_config::ExecutorKind;
use trellis_core::{NodeError, NodeValue};
use trellis_plan::{NodeFn, NodeInputs};

fn worker_lost(err: impl std::fmt::Display) -> AttemptError {
    AttemptError::Node(NodeError::new("WorkerError", err.to_string()))
}

/// Spawn one tokio task per node, each reporting on `completions`
fn dispatch<F, Fut>(
    tasks: Vec<NodeTask>,
    completions: &mpsc::UnboundedSender<NodeOutcome>,
    cancel: &CancellationToken,
    attempt: F,
) where
    F: Fn(NodeFn, NodeInputs) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<NodeValue, AttemptError>> + Send + 'static,
{
    for task in tasks {
        let completions = completions.clone();
        let cancel = cancel.clone();
        let attempt = attempt.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                outcome = run_task(task, attempt) => {
                    let _ = completions.send(outcome);
                }
            }
        });
    }
}

/// Bounded pool of blocking threads sharing the process's memory
#[derive(Debug, Clone)]
pub struct ThreadPool {
    workers: usize,
    permits: Arc<Semaphore>,
}

impl ThreadPool {
    /// Create a pool running at most `workers` attempts at once
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Concurrency bound
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }
}

#[async_trait]
impl ExecutorAdapter for ThreadPool {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ThreadPool
    }

    async fn submit(
        &self,
        tasks: Vec<NodeTask>,
        completions: mpsc::UnboundedSender<NodeOutcome>,
        cancel: CancellationToken,
    ) {
        let permits = Arc::clone(&self.permits);
        dispatch(tasks, &completions, &cancel, move |func, inputs| {
            let permits = Arc::clone(&permits);
            async move {
                let _permit = permits.acquire_owned().await.map_err(worker_lost)?;
                tokio::task::spawn_blocking(move || invoke(&func, &inputs))
                    .await
                    .map_err(worker_lost)?
                    .map_err(AttemptError::from)
            }
        });
    }
}

/// Bounded pool of isolated workers.
///
/// Arguments are encoded before an attempt starts and the result is
/// decoded after it ends; opaque values fail with a serialization error.
#[derive(Debug, Clone)]
pub struct ProcessPool {
    workers: usize,
    permits: Arc<Semaphore>,
}

impl ProcessPool {
    /// Create a pool running at most `workers` attempts at once
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Concurrency bound
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }
}

async fn isolated_attempt(
    permits: Arc<Semaphore>,
    func: NodeFn,
    inputs: NodeInputs,
) -> Result<NodeValue, AttemptError> {
    let payload = codec::encode_inputs(&inputs)?;
    drop(inputs);

    let _permit = permits.acquire_owned().await.map_err(worker_lost)?;
    let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, AttemptError> {
        let inputs = codec::decode_inputs(&payload)?;
        let value = invoke(&func, &inputs)?;
        Ok(codec::encode_output(&value)?)
    })
    .await
    .map_err(worker_lost)??;

    Ok(codec::decode_output(&encoded)?)
}

#[async_trait]
impl ExecutorAdapter for ProcessPool {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ProcessPool
    }

    async fn submit(
        &self,
        tasks: Vec<NodeTask>,
        completions: mpsc::UnboundedSender<NodeOutcome>,
        cancel: CancellationToken,
    ) {
        let permits = Arc::clone(&self.permits);
        dispatch(tasks, &completions, &cancel, move |func, inputs| {
            isolated_attempt(Arc::clone(&permits), func, inputs)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(name: &str, func: NodeFn, inputs: NodeInputs) -> NodeTask {
        NodeTask {
            name: name.into(),
            func,
            inputs,
            policy: Arc::new(RetryPolicy::none()),
            slot: None,
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<NodeOutcome>, n: usize) -> Vec<NodeOutcome> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(rx.recv().await.unwrap());
        }
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_threadpool_respects_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let func: NodeFn = {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            Arc::new(move |_: &NodeInputs| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(NodeValue::null())
            })
        };

        let pool = ThreadPool::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tasks = (0..6)
            .map(|i| task(&format!("n{}", i), Arc::clone(&func), NodeInputs::new()))
            .collect();
        pool.submit(tasks, tx, CancellationToken::new()).await;

        let outcomes = collect(&mut rx, 6).await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_threadpool_passes_opaque_values() {
        let func: NodeFn = Arc::new(|inputs: &NodeInputs| {
            let conn = inputs.opaque::<String>("conn")?;
            Ok(NodeValue::from(conn.len() as i64))
        });
        let mut inputs = NodeInputs::new();
        inputs.insert("conn", NodeValue::opaque(String::from("postgres")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        ThreadPool::new(1)
            .submit(vec![task("len", func, inputs)], tx, CancellationToken::new())
            .await;
        assert_eq!(rx.recv().await.unwrap().result, Ok(NodeValue::from(8i64)));
    }

    #[tokio::test]
    async fn test_processpool_rejects_opaque_input() {
        let func: NodeFn = Arc::new(|_: &NodeInputs| Ok(NodeValue::null()));
        let mut inputs = NodeInputs::new();
        inputs.insert("conn", NodeValue::opaque(String::from("postgres")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        ProcessPool::new(1)
            .submit(vec![task("query", func, inputs)], tx, CancellationToken::new())
            .await;
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(AttemptError::Serialization(e)) if e.reason.contains("conn")));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_processpool_rejects_opaque_output() {
        let func: NodeFn = Arc::new(|_: &NodeInputs| Ok(NodeValue::opaque(42u8)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        ProcessPool::new(1)
            .submit(vec![task("model", func, NodeInputs::new())], tx, CancellationToken::new())
            .await;
        assert!(matches!(
            rx.recv().await.unwrap().result,
            Err(AttemptError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_processpool_roundtrips_data() {
        let func: NodeFn = Arc::new(|inputs: &NodeInputs| Ok(NodeValue::from(inputs.f64("x")? + 1.0)));
        let mut inputs = NodeInputs::new();
        inputs.insert("x", NodeValue::from(1.5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        ProcessPool::new(2)
            .submit(vec![task("inc", func, inputs)], tx, CancellationToken::new())
            .await;
        assert_eq!(rx.recv().await.unwrap().result, Ok(NodeValue::from(2.5)));
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_outcomes() {
        let func: NodeFn = Arc::new(|_: &NodeInputs| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(NodeValue::null())
        });
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ThreadPool::new(1)
            .submit(vec![task("slow", func, NodeInputs::new())], tx, cancel.clone())
            .await;
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
