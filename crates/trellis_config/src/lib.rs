//! Trellis Configuration
//!
//! Configuration for a run comes from up to four layers: project
//! defaults, the pipeline document's `run:` section, a runtime
//! `RunConfig`-shaped object and direct keyword overrides. This crate
//! loads the documents, merges the layers by precedence and validates the
//! result into a typed [`RunConfig`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod layer;
pub mod overrides;
pub mod run;

pub use document::{PipelineDocument, ProjectDocument};
pub use error::{ConfigError, ConfigResult};
pub use layer::{ConfigLayer, EffectiveConfig, LayerScope, merge};
pub use overrides::RunOverrides;
pub use run::{CachePolicy, CallbackSpec, ExecutorConfig, ExecutorKind, RetryConfig, RunConfig};
