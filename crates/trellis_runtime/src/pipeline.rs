//! Pipeline entry points.
//!
//! A [`PipelineRunner`] owns the loaded documents, the registered node
//! modules and the caches shared by every run of one pipeline.

use crate::cache::ResultCache;
use crate::callback::CallbackRegistry;
use crate::engine::{RunEnvironment, RunOrchestrator, RunResult};
use crate::error::RunError;
use crate::executor::ExecutorFactory;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use trellis_config::{ConfigLayer, LayerScope, PipelineDocument, ProjectDocument, RunOverrides};
use trellis_core::NodeValue;
use trellis_plan::{GraphCache, NodeModule};

/// Per-call options for a run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Keyword overrides
    pub overrides: RunOverrides,
    /// Runtime configuration layer
    pub run_config: Option<Map<String, Value>>,
    /// In-process literal inputs
    pub values: IndexMap<String, NodeValue>,
    /// Cancellation signal
    pub cancel: Option<CancellationToken>,
}

impl RunRequest {
    /// Request the given outputs
    #[must_use]
    pub fn outputs<I, S>(final_vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RunOverrides::outputs(final_vars).into()
    }

    /// Attach a runtime configuration layer
    #[must_use]
    pub fn with_run_config(mut self, run_config: Map<String, Value>) -> Self {
        self.run_config = Some(run_config);
        self
    }

    /// Supply an in-process input
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: NodeValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Observe a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl From<RunOverrides> for RunRequest {
    fn from(overrides: RunOverrides) -> Self {
        Self {
            overrides,
            ..Self::default()
        }
    }
}

/// Runs one pipeline against its project and pipeline documents
#[derive(Debug)]
pub struct PipelineRunner {
    project: ProjectDocument,
    pipeline: PipelineDocument,
    application: RwLock<IndexMap<String, Arc<NodeModule>>>,
    library: RwLock<IndexMap<String, Arc<NodeModule>>>,
    callbacks: Arc<CallbackRegistry>,
    executors: Arc<ExecutorFactory>,
    graphs: Arc<GraphCache>,
    results: Arc<ResultCache>,
}

impl PipelineRunner {
    /// Create a runner for a pipeline document
    #[must_use]
    pub fn new(pipeline: PipelineDocument) -> Self {
        Self {
            project: ProjectDocument::default(),
            pipeline,
            application: RwLock::new(IndexMap::new()),
            library: RwLock::new(IndexMap::new()),
            callbacks: Arc::new(CallbackRegistry::new()),
            executors: Arc::new(ExecutorFactory::new()),
            graphs: Arc::new(GraphCache::new()),
            results: Arc::new(ResultCache::new()),
        }
    }

    /// Set the project document
    #[must_use]
    pub fn with_project(mut self, project: ProjectDocument) -> Self {
        self.project = project;
        self
    }

    /// Add a module composing the pipeline
    #[must_use]
    pub fn with_module(self, module: NodeModule) -> Self {
        self.register_module(module);
        self
    }

    /// Add a module runs may request through `additional_modules`
    #[must_use]
    pub fn with_library_module(self, module: NodeModule) -> Self {
        write(&self.library).insert(module.name.clone(), Arc::new(module));
        self
    }

    /// Set the callbacks runs may reference
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    /// Set the executor factory
    #[must_use]
    pub fn with_executors(mut self, executors: ExecutorFactory) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    /// Register or replace a pipeline module.
    ///
    /// A replacement keeps the module's composition position. Runs already
    /// past graph construction keep the graph they resolved against.
    pub fn register_module(&self, module: NodeModule) {
        let mut application = write(&self.application);
        if application.contains_key(&module.name) {
            tracing::debug!(module = %module.name, revision = module.revision, "Replacing module");
        }
        application.insert(module.name.clone(), Arc::new(module));
    }

    /// Pipeline document
    #[must_use]
    pub fn pipeline(&self) -> &PipelineDocument {
        &self.pipeline
    }

    /// Project document
    #[must_use]
    pub fn project(&self) -> &ProjectDocument {
        &self.project
    }

    /// Graph cache shared by runs
    #[must_use]
    pub fn graphs(&self) -> &GraphCache {
        &self.graphs
    }

    /// Result cache shared by runs
    #[must_use]
    pub fn results(&self) -> &ResultCache {
        &self.results
    }

    /// Configuration layers for a request, lowest precedence first
    #[must_use]
    pub fn layers(&self, request: &RunRequest) -> Vec<ConfigLayer> {
        let mut layers = vec![self.project.layer(), self.pipeline.layer()];
        if let Some(run_config) = &request.run_config {
            layers.push(ConfigLayer::from_map(LayerScope::Runtime, run_config.clone()));
        }
        layers.push(request.overrides.clone().into_layer());
        layers
    }

    /// Build an orchestrator for one run without starting it
    #[must_use]
    pub fn orchestrator(&self, request: RunRequest) -> RunOrchestrator {
        let env = RunEnvironment {
            application: read(&self.application).values().cloned().collect(),
            library: read(&self.library).clone(),
            params: self.pipeline.params.clone(),
            callbacks: Arc::clone(&self.callbacks),
            executors: Arc::clone(&self.executors),
            graphs: Arc::clone(&self.graphs),
            results: Arc::clone(&self.results),
        };
        let layers = self.layers(&request);
        let RunRequest { values, cancel, .. } = request;

        let orchestrator = RunOrchestrator::new(env, layers).with_values(values);
        match cancel {
            Some(cancel) => orchestrator.with_cancel(cancel),
            None => orchestrator,
        }
    }

    /// Run the pipeline on the caller's async runtime
    ///
    /// # Errors
    ///
    /// Returns the run's fatal error
    pub async fn run_async(&self, request: impl Into<RunRequest>) -> Result<RunResult, RunError> {
        self.orchestrator(request.into()).run().await
    }

    /// Run the pipeline to completion on a dedicated runtime.
    ///
    /// Must not be called from within an async runtime.
    ///
    /// # Errors
    ///
    /// Returns the run's fatal error, or [`RunError::Runtime`] if no
    /// runtime could be started
    pub fn run(&self, request: impl Into<RunRequest>) -> Result<RunResult, RunError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("trellis-run")
            .build()
            .map_err(|e| RunError::Runtime(e.to_string()))?;
        runtime.block_on(self.run_async(request))
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
