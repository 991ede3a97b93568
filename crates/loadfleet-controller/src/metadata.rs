//! Durable metadata the controller reads and writes: plans, runs, running-plan
//! rows and launch history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadfleet_core::{
    CollectionId, ExecutionPlan, LoadfleetError, LoadfleetResult, Plan, PlanId, ProjectId, RunId,
    RunningPlan,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One `collection_launch_history` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchEntry {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Deployment context the collection was launched in.
    pub context: String,
    /// Billing owner of the project.
    pub owner: String,
    /// Engines requested across all plans.
    pub engines: u32,
    /// Nodes the engines occupy.
    pub nodes: u32,
    /// Engines times concurrency, summed over plans.
    pub virtual_users: u64,
    /// When the collection was deployed.
    pub started_time: DateTime<Utc>,
    /// Set when usage is billed.
    pub end_time: Option<DateTime<Utc>>,
    /// Virtual users billed when the launch was closed.
    pub billed_virtual_users: Option<u64>,
}

/// One run of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub id: RunId,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// When the run started.
    pub started_time: DateTime<Utc>,
    /// When the run was finished, if it was.
    pub end_time: Option<DateTime<Utc>>,
}

/// Durable records the controller reads and writes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Execution plans of a collection, in collection order.
    async fn execution_plans(&self, collection_id: CollectionId) -> LoadfleetResult<Vec<ExecutionPlan>>;
    /// A plan with its test file and data files.
    async fn get_plan(&self, plan_id: PlanId) -> LoadfleetResult<Plan>;
    /// Billing owner of a project.
    async fn project_owner(&self, project_id: ProjectId) -> LoadfleetResult<String>;

    /// Record that a collection was deployed.
    async fn new_launch_entry(&self, entry: LaunchEntry) -> LoadfleetResult<()>;
    /// Close the open launch entry of a collection, recording billed usage.
    async fn mark_usage_finished(&self, collection_id: CollectionId, virtual_users: u64) -> LoadfleetResult<()>;

    /// Allocate a new run id for a collection.
    async fn start_run(&self, collection_id: CollectionId) -> LoadfleetResult<RunId>;
    /// Point the collection's current run at `run_id`.
    async fn new_run(&self, collection_id: CollectionId, run_id: RunId) -> LoadfleetResult<()>;
    /// The collection's current run, 0 if none.
    async fn current_run(&self, collection_id: CollectionId) -> LoadfleetResult<RunId>;
    /// Clear the collection's current run.
    async fn stop_run(&self, collection_id: CollectionId) -> LoadfleetResult<()>;
    /// Stamp the end time of a run.
    async fn run_finish(&self, collection_id: CollectionId, run_id: RunId) -> LoadfleetResult<()>;

    /// Mark a plan as running, stamped now.
    async fn add_running_plan(&self, collection_id: CollectionId, plan_id: PlanId) -> LoadfleetResult<()>;
    /// The plan's running row, if any.
    async fn get_running_plan(
        &self,
        collection_id: CollectionId,
        plan_id: PlanId,
    ) -> LoadfleetResult<Option<RunningPlan>>;
    /// Remove a running-plan row. Removing an absent row is not an error.
    async fn delete_running_plan(&self, collection_id: CollectionId, plan_id: PlanId) -> LoadfleetResult<()>;
}

#[derive(Default)]
struct Tables {
    plans: HashMap<PlanId, Plan>,
    execution_plans: HashMap<CollectionId, Vec<ExecutionPlan>>,
    owners: HashMap<ProjectId, String>,
    launches: Vec<LaunchEntry>,
    runs: HashMap<RunId, RunRecord>,
    current_runs: HashMap<CollectionId, RunId>,
    running_plans: HashMap<(CollectionId, PlanId), RunningPlan>,
    next_run_id: RunId,
}

/// Metadata kept in process memory. Used in dev mode and tests.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a plan.
    pub fn put_plan(&self, plan: Plan) {
        self.tables.write().plans.insert(plan.id, plan);
    }

    /// Seed a collection's execution plans.
    pub fn put_execution_plans(&self, collection_id: CollectionId, plans: Vec<ExecutionPlan>) {
        self.tables
            .write()
            .execution_plans
            .insert(collection_id, plans);
    }

    /// Seed a project's billing owner.
    pub fn put_project_owner(&self, project_id: ProjectId, owner: impl Into<String>) {
        self.tables.write().owners.insert(project_id, owner.into());
    }

    /// Every launch entry, oldest first.
    pub fn launches(&self) -> Vec<LaunchEntry> {
        self.tables.read().launches.clone()
    }

    /// A run by id.
    pub fn run(&self, run_id: RunId) -> Option<RunRecord> {
        self.tables.read().runs.get(&run_id).cloned()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn execution_plans(&self, collection_id: CollectionId) -> LoadfleetResult<Vec<ExecutionPlan>> {
        Ok(self
            .tables
            .read()
            .execution_plans
            .get(&collection_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_plan(&self, plan_id: PlanId) -> LoadfleetResult<Plan> {
        self.tables
            .read()
            .plans
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| LoadfleetError::Controller(format!("plan {plan_id} not found")))
    }

    async fn project_owner(&self, project_id: ProjectId) -> LoadfleetResult<String> {
        self.tables
            .read()
            .owners
            .get(&project_id)
            .cloned()
            .ok_or_else(|| LoadfleetError::Controller(format!("project {project_id} not found")))
    }

    async fn new_launch_entry(&self, entry: LaunchEntry) -> LoadfleetResult<()> {
        self.tables.write().launches.push(entry);
        Ok(())
    }

    async fn mark_usage_finished(&self, collection_id: CollectionId, virtual_users: u64) -> LoadfleetResult<()> {
        let mut tables = self.tables.write();
        if let Some(entry) = tables
            .launches
            .iter_mut()
            .rev()
            .find(|e| e.collection_id == collection_id && e.end_time.is_none())
        {
            entry.end_time = Some(Utc::now());
            entry.billed_virtual_users = Some(virtual_users);
        }
        Ok(())
    }

    async fn start_run(&self, collection_id: CollectionId) -> LoadfleetResult<RunId> {
        let mut tables = self.tables.write();
        tables.next_run_id += 1;
        let id = tables.next_run_id;
        tables.runs.insert(
            id,
            RunRecord {
                id,
                collection_id,
                started_time: Utc::now(),
                end_time: None,
            },
        );
        Ok(id)
    }

    async fn new_run(&self, collection_id: CollectionId, run_id: RunId) -> LoadfleetResult<()> {
        self.tables.write().current_runs.insert(collection_id, run_id);
        Ok(())
    }

    async fn current_run(&self, collection_id: CollectionId) -> LoadfleetResult<RunId> {
        Ok(self
            .tables
            .read()
            .current_runs
            .get(&collection_id)
            .copied()
            .unwrap_or_default())
    }

    async fn stop_run(&self, collection_id: CollectionId) -> LoadfleetResult<()> {
        self.tables.write().current_runs.remove(&collection_id);
        Ok(())
    }

    async fn run_finish(&self, collection_id: CollectionId, run_id: RunId) -> LoadfleetResult<()> {
        if let Some(run) = self
            .tables
            .write()
            .runs
            .get_mut(&run_id)
            .filter(|r| r.collection_id == collection_id)
        {
            run.end_time.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn add_running_plan(&self, collection_id: CollectionId, plan_id: PlanId) -> LoadfleetResult<()> {
        self.tables.write().running_plans.insert(
            (collection_id, plan_id),
            RunningPlan {
                collection_id,
                plan_id,
                started_time: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_running_plan(
        &self,
        collection_id: CollectionId,
        plan_id: PlanId,
    ) -> LoadfleetResult<Option<RunningPlan>> {
        Ok(self
            .tables
            .read()
            .running_plans
            .get(&(collection_id, plan_id))
            .cloned())
    }

    async fn delete_running_plan(&self, collection_id: CollectionId, plan_id: PlanId) -> LoadfleetResult<()> {
        self.tables
            .write()
            .running_plans
            .remove(&(collection_id, plan_id));
        Ok(())
    }
}
