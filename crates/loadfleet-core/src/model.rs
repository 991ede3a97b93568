use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan_kind::PlanKind;

/// Identifier of a project (the namespace a coordinator serves).
pub type ProjectId = i64;
/// Identifier of a collection.
pub type CollectionId = i64;
/// Identifier of a plan.
pub type PlanId = i64;
/// Identifier of one triggered execution of a collection.
pub type RunId = i64;

/// A file reference: a name plus the object-storage path it lives at.
///
/// `content` is only populated transiently while a trigger is being prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Bare file name as uploaded.
    pub filename: String,
    /// Object-storage path used to download the content.
    pub filepath: String,
    /// Downloaded content, if already fetched.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl DataFile {
    /// Create a file reference without content.
    pub fn new(filename: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            filepath: filepath.into(),
            content: None,
        }
    }
}

/// A test script and the data files uploaded alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Human readable plan name.
    pub name: String,
    /// Owning project.
    pub project_id: ProjectId,
    /// Which load generator runs the script.
    pub kind: PlanKind,
    /// The uploaded test script, if any.
    pub test_file: Option<DataFile>,
    /// Plan-scoped data files.
    #[serde(default)]
    pub data: Vec<DataFile>,
}

/// The binding of a [`Plan`] into a [`Collection`] with its run parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The bound plan.
    pub plan_id: PlanId,
    /// Number of engines requested for this plan (at least 1).
    pub engines: u32,
    /// Virtual users per engine.
    pub concurrency: u32,
    /// Test duration in minutes.
    pub duration: u32,
    /// Ramp-up time in seconds.
    pub rampup: u32,
    /// Whether data files are split across this plan's engines.
    #[serde(default)]
    pub csv_split: bool,
}

impl ExecutionPlan {
    /// Virtual users this plan generates across all of its engines.
    pub fn virtual_users(&self) -> u64 {
        u64::from(self.engines) * u64::from(self.concurrency)
    }
}

/// A named group of plans run together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    /// Collection identifier.
    pub id: CollectionId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Ordered execution plans.
    #[serde(default)]
    pub execution_plans: Vec<ExecutionPlan>,
    /// Collection-scoped data files shared by every plan.
    #[serde(default)]
    pub data: Vec<DataFile>,
    /// Whether shared data is split across plans.
    #[serde(default)]
    pub csv_split: bool,
    /// The active run, if a test is currently in progress.
    #[serde(default)]
    pub current_run: Option<RunId>,
}

impl Collection {
    /// Total engines requested across all execution plans.
    pub fn total_engines(&self) -> u32 {
        self.execution_plans.iter().map(|ep| ep.engines).sum()
    }

    /// Total virtual users across all execution plans.
    pub fn total_virtual_users(&self) -> u64 {
        self.execution_plans
            .iter()
            .map(ExecutionPlan::virtual_users)
            .sum()
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        matches!(self.current_run, Some(run) if run > 0)
    }
}

/// A durable "this plan is running" record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningPlan {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// The running plan.
    pub plan_id: PlanId,
    /// When the plan was triggered.
    pub started_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(plan_id: PlanId, engines: u32, concurrency: u32) -> ExecutionPlan {
        ExecutionPlan {
            plan_id,
            engines,
            concurrency,
            duration: 5,
            rampup: 10,
            csv_split: false,
        }
    }

    #[test]
    fn test_collection_totals() {
        let collection = Collection {
            id: 1,
            project_id: 1,
            execution_plans: vec![ep(1, 2, 50), ep(2, 3, 10)],
            ..Default::default()
        };
        assert_eq!(collection.total_engines(), 5);
        assert_eq!(collection.total_virtual_users(), 130);
    }

    #[test]
    fn test_collection_running_flag() {
        let mut collection = Collection::default();
        assert!(!collection.is_running());
        collection.current_run = Some(0);
        assert!(!collection.is_running());
        collection.current_run = Some(7);
        assert!(collection.is_running());
    }
}
