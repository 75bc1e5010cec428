//! # Uplift Core
//!
//! Change-driven provisioning pipeline: a committed write to the upload
//! metadata table reliably launches exactly one short-lived, narrowly scoped
//! worker for the uploaded file.
//!
//! ## Flow
//!
//! client → [`objects::UploadTargetIssuer`] → object write →
//! [`ingest::IngestionService`] → [`store::MetadataStore`] →
//! [`feed::ChangeFeed`] → [`runtime::PipelineRuntime`] →
//! [`dispatcher::ChangeDispatcher`] → [`provisioner::ComputeProvisioner`] →
//! [`compute::ComputeAllocator`]
//!
//! ## Guarantees
//!
//! - Events for one record are handled in write order; partitions progress
//!   independently.
//! - Delivery is at-least-once. The provisioner's ledger makes a duplicate
//!   delivery return the handle of the worker already launched.
//! - Retryable failures are redelivered with backoff, fatal ones and those
//!   exceeding the attempt bound land in the [`dead_letter`] channel.
//! - Every outbound call is checked against the [`access`] table.
//!
//! Provider-bound collaborators are traits; the in-memory implementations
//! shipped here honour the same contracts and are wired together by
//! [`local::InMemoryPipeline`].

#![allow(missing_docs)]

/// Access policy layer: principals, actions, policies
pub mod access;
pub mod compute;
/// Pipeline configuration with defaults
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
/// Error types and error classification
pub mod error;
pub mod events;
/// Partitioned change feed
pub mod feed;
pub mod ingest;
pub mod local;
pub mod objects;
pub mod provisioner;
pub mod runtime;
/// Metadata store
pub mod store;
pub mod types;

pub use error::{Disposition, ErrorClass, PipelineError, Result};
