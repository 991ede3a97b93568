//! Core types and error definitions for loadfleet.
//!
//! This crate provides the types shared by the coordinator, the controller
//! and the engines: the collection/plan model, the per-engine data
//! assignments, the broker payload, and the unified error type.
//!
//! # Main types
//!
//! - [`LoadfleetError`] — Unified error enum for all loadfleet subsystems.
//! - [`LoadfleetResult`] — Convenience alias for `Result<T, LoadfleetError>`.
//! - [`Collection`] / [`ExecutionPlan`] / [`Plan`] — What gets run, and how big.
//! - [`PlanKind`] / [`PlanCapability`] — Load-generator kinds and their fixed behaviour.
//! - [`PlanEnginesConfig`] / [`EngineDataConfig`] — Per-engine trigger parameters.
//! - [`Payload`] / [`EngineMessage`] — The start/stop message broadcast to engines.

/// CSV splitting across engines.
pub mod csv;
/// Per-engine trigger parameters.
pub mod engine_config;
/// Unified error type.
pub mod error;
/// Collections, plans, and run bookkeeping records.
pub mod model;
/// Broker payload exchanged with engines.
pub mod payload;
/// Load-generator kinds and their test file handling.
pub mod plan_kind;

pub use csv::split_csv;
pub use engine_config::{EngineDataConfig, EngineDataFile, PlanEnginesConfig};
pub use error::{LoadfleetError, LoadfleetResult};
pub use model::{
    Collection, CollectionId, DataFile, ExecutionPlan, Plan, PlanId, ProjectId, RunId,
    RunningPlan,
};
pub use payload::{collection_topic, EngineMessage, Payload, PlanMessage, Verb};
pub use plan_kind::{PlanCapability, PlanKind, RenderedFile};
