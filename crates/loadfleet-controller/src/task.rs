//! Background deploy handle and its per-plan report.

use loadfleet_core::{CollectionId, LoadfleetError, LoadfleetResult, PlanId};
use tokio::task::JoinHandle;

/// What happened to one plan during a background deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDeployOutcome {
    /// Plan that was deployed.
    pub plan_id: PlanId,
    /// Engines the scheduler accepted.
    pub deployed: u32,
    /// Engines the execution plan asked for.
    pub requested: u32,
    /// Errors from engines that failed after all retries.
    pub errors: Vec<String>,
}

impl PlanDeployOutcome {
    /// Every requested engine deployed without error.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.deployed == self.requested
    }
}

/// Per-plan outcomes of one `deploy_collection` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    /// Owning collection.
    pub collection_id: CollectionId,
    pub plans: Vec<PlanDeployOutcome>,
}

impl DeployReport {
    /// Every plan is complete.
    pub fn is_complete(&self) -> bool {
        self.plans.iter().all(PlanDeployOutcome::is_complete)
    }

    /// Collapse the report into an aggregate error listing every failed engine.
    pub fn into_result(self) -> LoadfleetResult<()> {
        let errors: Vec<String> = self
            .plans
            .into_iter()
            .flat_map(|p| {
                let plan_id = p.plan_id;
                p.errors
                    .into_iter()
                    .map(move |e| format!("plan {plan_id}: {e}"))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LoadfleetError::Aggregate(errors))
        }
    }
}

/// Handle to a background deploy. Dropping it detaches the task.
#[derive(Debug)]
pub struct DeployTask {
    collection_id: CollectionId,
    handle: JoinHandle<DeployReport>,
}

impl DeployTask {
    pub(crate) fn new(collection_id: CollectionId, handle: JoinHandle<DeployReport>) -> Self {
        Self {
            collection_id,
            handle,
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    /// Whether the background task has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for every plan's deploy to finish.
    pub async fn wait(self) -> LoadfleetResult<DeployReport> {
        self.handle.await.map_err(|e| {
            LoadfleetError::Controller(format!(
                "deploy task for collection {} failed: {e}",
                self.collection_id
            ))
        })
    }
}
