//! Collection lifecycle controller for loadfleet.
//!
//! The [`Controller`] is what an API layer calls to change a collection's
//! desired state. It provisions engines through a [`Scheduler`], drives the
//! project's coordinator over HTTP, and records runs and usage in a
//! [`MetadataStore`].
//!
//! # Main types
//!
//! - [`Controller`] — deploy, trigger, status, terminate, purge, subscribe.
//! - [`Scheduler`] / [`MetadataStore`] / [`ObjectStorage`] — Collaborators, passed in at construction.
//! - [`DeployTask`] — Handle to a background deploy.
//! - [`MetricStreams`] — Live metric-stream clients and their engine readers.

/// Collection lifecycle operations.
pub mod controller;
/// Engine metric stream connections.
pub mod engine;
/// Data file assignment per engine.
pub mod execution_data;
/// Durable run, launch and running-plan records.
pub mod metadata;
/// Plan and collection file storage.
pub mod object_storage;
/// Backoff for deploy calls.
pub mod retry;
/// Engine provisioning capability.
pub mod scheduler;
/// Live metric-stream clients.
pub mod stream;
/// Background deploy handle.
pub mod task;

pub use controller::Controller;
pub use engine::{EngineConnection, EngineStream, MetricEvent};
pub use execution_data::ExecutionData;
pub use metadata::{InMemoryMetadataStore, LaunchEntry, MetadataStore, RunRecord};
pub use object_storage::{FsObjectStorage, ObjectStorage};
pub use retry::RetryPolicy;
pub use scheduler::{CollectionStatus, EngineOwnerRef, PlanStatus, Scheduler};
pub use stream::MetricStreams;
pub use task::{DeployReport, DeployTask, PlanDeployOutcome};
