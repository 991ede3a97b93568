//! The cluster orchestration platform, as the controller sees it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadfleet_core::{CollectionId, ExecutionPlan, LoadfleetResult, PlanId, ProjectId};
use serde::{Deserialize, Serialize};

/// Identifies one engine to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOwnerRef {
    /// Owning project.
    pub project_id: ProjectId,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Plan the engine runs.
    pub plan_id: PlanId,
    /// Ordinal within the plan.
    pub engine_id: u32,
}

/// Deployment state of one plan's engines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStatus {
    /// Plan this status describes.
    pub plan_id: PlanId,
    /// Engines requested.
    pub engines: u32,
    /// Engines the platform reports as deployed.
    pub engines_deployed: u32,
    /// Deployed, scraped, and confirmed by the coordinator.
    pub engines_reachable: bool,
    /// A run of this plan is in progress.
    pub in_progress: bool,
    /// When the running plan was triggered.
    pub started_time: Option<DateTime<Utc>>,
}

/// Deployment state of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatus {
    /// Owning collection.
    pub collection_id: CollectionId,
    pub plans: Vec<PlanStatus>,
    /// The collection's metrics scraper exists.
    pub scraper_deployed: bool,
}

/// Provisions and inspects engines on the orchestration platform.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Expose the project's network identity; returns the service address engines report to.
    async fn expose_project(&self, project_id: ProjectId) -> LoadfleetResult<String>;

    /// Create the metrics scraper for a collection.
    async fn create_collection_scraper(&self, collection_id: CollectionId) -> LoadfleetResult<()>;

    /// Provision one engine.
    async fn deploy_engine(&self, engine: &EngineOwnerRef, service_addr: &str) -> LoadfleetResult<()>;

    /// Deployment state of every plan in `plans`.
    async fn collection_status(
        &self,
        project_id: ProjectId,
        collection_id: CollectionId,
        plans: &[ExecutionPlan],
    ) -> LoadfleetResult<CollectionStatus>;

    /// Base URLs of a plan's engines, one per ordinal.
    async fn fetch_engine_urls_by_plan(
        &self,
        project_id: ProjectId,
        collection_id: CollectionId,
        plan_id: PlanId,
        engines: u32,
    ) -> LoadfleetResult<Vec<String>>;

    /// Delete every resource provisioned for a collection.
    async fn purge_collection(&self, collection_id: CollectionId) -> LoadfleetResult<()>;

    /// Where the project's coordinator is reachable.
    async fn ingress_url(&self, project_id: ProjectId) -> LoadfleetResult<String>;

    /// Bearer key for the project's coordinator.
    async fn project_api_key(&self, project_id: ProjectId) -> LoadfleetResult<String>;
}
