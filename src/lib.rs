//! WolfMirror - Concurrent Document Replication
//!
//! Applies one document-store operation to a set of replica databases
//! concurrently, with a ceiling on how many replicas are worked on at once,
//! and reports the outcome of every replica.
//!
//! # Architecture
//!
//! An operation descriptor is sanitized once, then fanned out to the targets
//! in batches. Each target gets its own short-lived connection, released on
//! every exit path, and its own outcome. The outcomes are folded into an
//! aggregate report that decides whether the run was a critical failure.
//!
//! # Features
//!
//! - Field normalization of filters, data and pipelines before dispatch
//! - Eleven document-store operations mapped to an affected-document count
//! - Bounded concurrency with sequential batches for long target lists
//! - Acquisition timeouts and failure isolation per replica
//! - MongoDB and in-memory store backends

pub mod config;
pub mod error;
pub mod operation;
pub mod replication;
pub mod report;
pub mod store;

pub use config::MirrorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MirrorConfig;
    pub use crate::error::{Error, FailureKind, Result};
    pub use crate::operation::{Document, OperationDescriptor, OperationKind, Sanitizer};
    pub use crate::replication::{ReplicaTarget, ReplicationRun, Replicator};
    pub use crate::report::{AggregateReport, Disposition, ReplicationOutcome};
    pub use crate::store::{Connector, DocumentStore, StoreConnector};
}
