//! Trellis Core Types
//!
//! Pure types shared by every Trellis crate: run identifiers, BLAKE3
//! fingerprints, node values and the error a node callable reports.
//! No I/O happens here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod value;

// Re-exports
pub use error::{ANY_ERROR, NodeError, SerializationError};
pub use hash::{Fingerprint, Fingerprinter, HashError};
pub use id::RunId;
pub use value::{NodeValue, OpaqueValue};
