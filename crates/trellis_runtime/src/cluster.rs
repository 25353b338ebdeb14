//! Distributed execution through a remote scheduler.
//!
//! Node arguments travel as an encoded payload. A transport failure is
//! surfaced as a `TransportError` node error, so retry policies can name it.

use crate::codec;
use crate::executor::{ExecutorAdapter, NodeOutcome, NodeTask, invoke, run_task};
use crate::retry::AttemptError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_config::ExecutorKind;
use trellis_core::{NodeError, NodeValue, SerializationError};
use trellis_plan::{NodeFn, NodeInputs};

/// Node error classifier for transport failures
pub const TRANSPORT_ERROR: &str = "TransportError";

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Remote execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Request ID
    pub request_id: String,
    /// Node to execute
    pub node: String,
    /// Encoded arguments
    pub payload: Vec<u8>,
    /// CPU hint
    pub num_cpus: Option<f64>,
}

impl RemoteRequest {
    /// Create a new remote request
    #[must_use]
    pub fn new(node: impl Into<String>, payload: Vec<u8>, num_cpus: Option<f64>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            node: node.into(),
            payload,
            num_cpus,
        }
    }
}

/// Remote execution response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Request ID this responds to
    pub request_id: String,
    /// Encoded result
    pub payload: Vec<u8>,
    /// Error raised by the node, if it failed
    pub error: Option<NodeError>,
}

impl RemoteResponse {
    /// Create a successful response
    #[must_use]
    pub fn success(request_id: String, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            payload,
            error: None,
        }
    }

    /// Create a failed response
    #[must_use]
    pub fn error(request_id: String, error: NodeError) -> Self {
        Self {
            request_id,
            payload: Vec::new(),
            error: Some(error),
        }
    }
}

/// A cluster that accepts node submissions
#[async_trait]
pub trait RemoteScheduler: Send + Sync {
    /// Scheduler name for logs
    fn name(&self) -> &str;

    /// Execute one node remotely
    ///
    /// # Errors
    ///
    /// Returns error if the request could not be delivered or answered
    async fn submit(&self, request: RemoteRequest, func: NodeFn) -> Result<RemoteResponse, TransportError>;
}

/// Loopback scheduler that executes submissions on the local blocking pool
#[derive(Debug, Clone)]
pub struct LocalCluster {
    name: String,
}

impl LocalCluster {
    /// Create a loopback scheduler
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl RemoteScheduler for LocalCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: RemoteRequest, func: NodeFn) -> Result<RemoteResponse, TransportError> {
        let RemoteRequest {
            request_id,
            payload,
            ..
        } = request;
        tokio::task::spawn_blocking(move || {
            let inputs = codec::decode_inputs(&payload)
                .map_err(|e| TransportError::Serialization(e.to_string()))?;
            Ok(match invoke(&func, &inputs) {
                Ok(value) => match codec::encode_output(&value) {
                    Ok(bytes) => RemoteResponse::success(request_id, bytes),
                    Err(e) => return Err(TransportError::Serialization(e.to_string())),
                },
                Err(error) => RemoteResponse::error(request_id, error),
            })
        })
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
    }
}

/// Executor backend that submits every node to a remote scheduler
pub struct Cluster {
    kind: ExecutorKind,
    scheduler: Arc<dyn RemoteScheduler>,
    num_cpus: Option<f64>,
}

impl Cluster {
    /// Create a backend over `scheduler`
    #[must_use]
    pub fn new(kind: ExecutorKind, scheduler: Arc<dyn RemoteScheduler>, num_cpus: Option<f64>) -> Self {
        Self {
            kind,
            scheduler,
            num_cpus,
        }
    }
}

async fn submit_remote(
    scheduler: &dyn RemoteScheduler,
    node: &str,
    func: NodeFn,
    inputs: &NodeInputs,
    num_cpus: Option<f64>,
) -> Result<NodeValue, AttemptError> {
    let payload = codec::encode_inputs(inputs)?;
    let request = RemoteRequest::new(node, payload, num_cpus);
    let request_id = request.request_id.clone();
    let answered = scheduler.submit(request, func).await.and_then(|response| {
        if response.request_id == request_id {
            Ok(response)
        } else {
            Err(TransportError::InvalidResponse(format!(
                "expected request {}, got {}",
                request_id, response.request_id
            )))
        }
    });
    let response = match answered {
        Ok(response) => response,
        Err(TransportError::Serialization(reason)) => {
            return Err(SerializationError::new("remote value", reason).into());
        }
        Err(e) => {
            tracing::warn!(scheduler = scheduler.name(), node, error = %e, "Remote submission failed");
            return Err(NodeError::new(TRANSPORT_ERROR, e.to_string()).into());
        }
    };
    match response.error {
        Some(error) => Err(error.into()),
        None => Ok(codec::decode_output(&response.payload)?),
    }
}

#[async_trait]
impl ExecutorAdapter for Cluster {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn submit(
        &self,
        tasks: Vec<NodeTask>,
        completions: mpsc::UnboundedSender<NodeOutcome>,
        cancel: CancellationToken,
    ) {
        for task in tasks {
            let scheduler = Arc::clone(&self.scheduler);
            let num_cpus = self.num_cpus;
            let completions = completions.clone();
            let cancel = cancel.clone();
            let node = task.name.clone();
            tokio::spawn(async move {
                let attempt = |func: NodeFn, inputs: NodeInputs| {
                    let scheduler = Arc::clone(&scheduler);
                    let node = node.clone();
                    async move { submit_remote(scheduler.as_ref(), &node, func, &inputs, num_cpus).await }
                };
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
}
