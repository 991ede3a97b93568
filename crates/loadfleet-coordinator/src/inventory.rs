//! Live table of ready engine endpoints, rebuilt by polling the cluster.
//!
//! Readiness is evaluated per collection: one plan short of replicas hides
//! every plan of that collection until the next cycle that sees it whole.

use async_trait::async_trait;
use loadfleet_core::{CollectionId, LoadfleetError, LoadfleetResult, PlanId, ProjectId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between refresh cycles.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3);

/// Workers carrying this kind are engines; every other kind is ignored.
pub const EXECUTOR_KIND: &str = "executor";

/// One ready address inside an endpoint group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    /// Pod IP.
    pub ip: String,
    /// Stable worker name, used as the lookup key for the stream proxy.
    pub name: String,
}

/// All ready addresses backing one plan, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGroup {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Owning plan.
    pub plan_id: PlanId,
    /// Worker kind label; only [`EXECUTOR_KIND`] groups are considered.
    pub kind: String,
    /// Ready addresses.
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    /// Service port the engines listen on, if the platform exposes one.
    #[serde(default)]
    pub port: Option<u16>,
}

/// The cluster orchestration platform, seen from the inventory.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// List every endpoint group in the project namespace.
    async fn list_endpoints(&self, project_id: ProjectId) -> LoadfleetResult<Vec<EndpointGroup>>;

    /// Number of replicas the platform is expected to run for one plan.
    async fn plan_replicas(
        &self,
        project_id: ProjectId,
        collection_id: CollectionId,
        plan_id: PlanId,
    ) -> LoadfleetResult<usize>;
}

/// An observed engine address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    /// `ip:port`.
    pub addr: String,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Owning plan.
    pub plan_id: PlanId,
    /// Stable worker name.
    pub key: String,
}

#[derive(Debug, Default)]
struct Table {
    by_collection: HashMap<CollectionId, HashMap<PlanId, Vec<EngineEndpoint>>>,
    by_key: HashMap<String, String>,
}

/// Continuously refreshed map from (collection, plan) and engine key to addresses.
pub struct Inventory {
    source: Arc<dyn EndpointSource>,
    interval: Duration,
    table: RwLock<Table>,
}

impl Inventory {
    /// Create an empty inventory backed by `source`.
    pub fn new(source: Arc<dyn EndpointSource>) -> Self {
        Self::with_interval(source, DEFAULT_REFRESH_INTERVAL)
    }

    /// Create an empty inventory that polls every `interval`.
    pub fn with_interval(source: Arc<dyn EndpointSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            table: RwLock::new(Table::default()),
        }
    }

    /// Poll the platform until `shutdown` fires.
    ///
    /// Listing errors are logged and retried on the next cycle.
    pub async fn refresh(&self, project_id: ProjectId, shutdown: CancellationToken) {
        info!(project_id, interval_ms = self.interval.as_millis() as u64, "Inventory refresh started");
        loop {
            if let Err(e) = self.refresh_cycle(project_id).await {
                warn!(project_id, error = %e, "Inventory refresh failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(project_id, "Inventory refresh stopped");
    }

    /// Run one poll cycle and publish the result.
    pub async fn refresh_cycle(&self, project_id: ProjectId) -> LoadfleetResult<()> {
        let groups = self.source.list_endpoints(project_id).await?;

        let mut not_ready: Vec<CollectionId> = Vec::new();
        let mut next = Table::default();
        for group in groups.iter().filter(|g| g.kind == EXECUTOR_KIND) {
            let cid = group.collection_id;
            if not_ready.contains(&cid) {
                continue;
            }
            let ready = match self.group_ready(project_id, group).await {
                Ok(ready) => ready,
                Err(e) => {
                    debug!(collection_id = cid, plan_id = group.plan_id, error = %e, "Replica query failed");
                    false
                }
            };
            if !ready {
                not_ready.push(cid);
                continue;
            }
            let Some(port) = group.port else {
                not_ready.push(cid);
                continue;
            };
            let endpoints: Vec<EngineEndpoint> = group
                .addresses
                .iter()
                .map(|a| EngineEndpoint {
                    addr: format!("{}:{port}", a.ip),
                    collection_id: cid,
                    plan_id: group.plan_id,
                    key: a.name.clone(),
                })
                .collect();
            next.by_collection
                .entry(cid)
                .or_default()
                .insert(group.plan_id, endpoints);
        }

        for cid in &not_ready {
            next.by_collection.remove(cid);
        }
        for plans in next.by_collection.values() {
            for endpoint in plans.values().flatten() {
                next.by_key.insert(endpoint.key.clone(), endpoint.addr.clone());
            }
        }

        debug!(
            project_id,
            ready_collections = next.by_collection.len(),
            not_ready = not_ready.len(),
            "Inventory cycle complete"
        );
        *self.table.write() = next;
        Ok(())
    }

    async fn group_ready(&self, project_id: ProjectId, group: &EndpointGroup) -> LoadfleetResult<bool> {
        if group.addresses.is_empty() {
            return Ok(false);
        }
        let replicas = self
            .source
            .plan_replicas(project_id, group.collection_id, group.plan_id)
            .await?;
        Ok(group.addresses.len() >= replicas)
    }

    /// Address of the engine with the given stable key.
    pub fn find_address(&self, key: &str) -> Option<String> {
        self.table.read().by_key.get(key).cloned()
    }

    /// Addresses serving one plan; empty unless the whole collection is ready.
    pub fn endpoints_for_plan(&self, collection_id: CollectionId, plan_id: PlanId) -> Vec<String> {
        self.table
            .read()
            .by_collection
            .get(&collection_id)
            .and_then(|plans| plans.get(&plan_id))
            .map(|eps| eps.iter().map(|e| e.addr.clone()).collect())
            .unwrap_or_default()
    }

    /// Total ready endpoints across every plan of a collection.
    pub fn count_for_collection(&self, collection_id: CollectionId) -> usize {
        self.table
            .read()
            .by_collection
            .get(&collection_id)
            .map(|plans| plans.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// One entry of the endpoints file read by [`FileEndpointSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEndpointEntry {
    /// Owning project.
    pub project_id: ProjectId,
    /// The endpoint group itself.
    #[serde(flatten)]
    pub group: EndpointGroup,
    /// Replicas the plan is expected to run.
    pub replicas: usize,
}

/// Endpoint source backed by a JSON file, for running a coordinator outside a cluster.
///
/// The file is re-read on every call so edits show up on the next cycle.
pub struct FileEndpointSource {
    path: PathBuf,
}

impl FileEndpointSource {
    /// Read endpoints from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> LoadfleetResult<Vec<FileEndpointEntry>> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            LoadfleetError::Inventory(format!("Failed to read '{}': {e}", self.path.display()))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl EndpointSource for FileEndpointSource {
    async fn list_endpoints(&self, project_id: ProjectId) -> LoadfleetResult<Vec<EndpointGroup>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|e| e.project_id == project_id)
            .map(|e| e.group)
            .collect())
    }

    async fn plan_replicas(
        &self,
        project_id: ProjectId,
        collection_id: CollectionId,
        plan_id: PlanId,
    ) -> LoadfleetResult<usize> {
        self.load()
            .await?
            .into_iter()
            .find(|e| {
                e.project_id == project_id
                    && e.group.collection_id == collection_id
                    && e.group.plan_id == plan_id
            })
            .map(|e| e.replicas)
            .ok_or_else(|| {
                LoadfleetError::Inventory(format!(
                    "no deployment for collection {collection_id} plan {plan_id}"
                ))
            })
    }
}
