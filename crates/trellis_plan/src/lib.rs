//! Trellis Planner
//!
//! Turns node modules into a validated DAG and a DAG into an ordered
//! execution plan. Node definitions carry declarative modifiers
//! (conditional variants, parameterization, column extraction) that are
//! expanded at build time, so every edge is known before anything runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod dag;
pub mod error;
pub mod expand;
pub mod module;
pub mod node;
pub mod resolve;

pub use cache::{GraphCache, GraphKey};
pub use dag::{Edge, Node, NodeGraph, NodeOrigin};
pub use error::{GraphError, ResolutionError};
pub use module::NodeModule;
pub use node::{Binding, InputSource, NodeDef, NodeFn, NodeInputs, ParamSets, Predicate};
pub use resolve::{ExecutionPlan, PlanWarning, resolve};
