//! The collection lifecycle.
//!
//! Deploy fans out per plan in the background, trigger prepares every plan's
//! files before one combined coordinator call, and terminate always clears
//! local running state whatever the coordinator says.

use chrono::Utc;
use futures_util::future::join_all;
use loadfleet_coordinator::{CoordinatorClient, FormFileKey, ReqOpts, UploadedFile};
use loadfleet_core::{
    Collection, CollectionId, ExecutionPlan, LoadfleetError, LoadfleetResult, Plan, PlanEnginesConfig,
    PlanId, ProjectId, RunId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::engine::{EngineConnection, EngineStream, MetricEvent};
use crate::execution_data::{prepare_plan, split_collection_data};
use crate::metadata::{LaunchEntry, MetadataStore};
use crate::object_storage::ObjectStorage;
use crate::retry::RetryPolicy;
use crate::scheduler::{CollectionStatus, EngineOwnerRef, PlanStatus, Scheduler};
use crate::stream::MetricStreams;
use crate::task::{DeployReport, DeployTask, PlanDeployOutcome};

/// Drives a collection through deploy, trigger, status, terminate and purge.
///
/// Holds no durable state; everything persistent goes through the
/// [`MetadataStore`]. The only in-process state is the metric-stream registry.
pub struct Controller {
    scheduler: Arc<dyn Scheduler>,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    client: CoordinatorClient,
    retry: RetryPolicy,
    context: String,
    streams: MetricStreams,
}

impl Controller {
    /// Wire the controller to its collaborators. `context` is the deployment
    /// context recorded on launch entries.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStorage>,
        client: CoordinatorClient,
        retry: RetryPolicy,
        context: impl Into<String>,
    ) -> Self {
        Self {
            scheduler,
            metadata,
            storage,
            client,
            retry,
            context: context.into(),
            streams: MetricStreams::new(reqwest::Client::new()),
        }
    }

    /// The live metric-stream registry.
    pub fn streams(&self) -> &MetricStreams {
        &self.streams
    }

    /// Record the launch, expose the project and start provisioning engines.
    ///
    /// Engine provisioning continues in the background; the returned task can
    /// be awaited or dropped.
    pub async fn deploy_collection(&self, collection: &Collection) -> LoadfleetResult<DeployTask> {
        let collection = self.load_plans(collection).await?;
        if collection.execution_plans.is_empty() {
            return Err(LoadfleetError::Precondition(format!(
                "collection {} has no execution plans",
                collection.id
            )));
        }
        let owner = self.metadata.project_owner(collection.project_id).await?;
        self.metadata
            .new_launch_entry(LaunchEntry {
                collection_id: collection.id,
                context: self.context.clone(),
                owner,
                engines: collection.total_engines(),
                nodes: 0,
                virtual_users: collection.total_virtual_users(),
                started_time: Utc::now(),
                end_time: None,
                billed_virtual_users: None,
            })
            .await?;

        let service_addr = self.scheduler.expose_project(collection.project_id).await?;
        self.scheduler
            .create_collection_scraper(collection.id)
            .await
            .inspect_err(|e| error!(collection_id = collection.id, error = %e, "Scraper creation failed"))?;

        let scheduler = self.scheduler.clone();
        let retry = self.retry.clone();
        let collection_id = collection.id;
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let plans = join_all(collection.execution_plans.iter().map(|ep| {
                deploy_plan(
                    scheduler.as_ref(),
                    &retry,
                    &service_addr,
                    collection.project_id,
                    collection_id,
                    ep,
                )
            }))
            .await;
            let report = DeployReport {
                collection_id,
                plans,
            };
            if report.is_complete() {
                info!(
                    collection_id,
                    duration_secs = started.elapsed().as_secs_f64(),
                    "All engine deployments finished"
                );
            } else {
                error!(collection_id, report = ?report, "Engine deployment incomplete");
            }
            report
        });
        Ok(DeployTask::new(collection_id, handle))
    }

    /// Start a new run of the collection. Returns the run id.
    pub async fn trigger_collection(&self, collection: &Collection) -> LoadfleetResult<RunId> {
        let collection = self.load_plans(collection).await?;
        let mut plans = Vec::with_capacity(collection.execution_plans.len());
        for ep in &collection.execution_plans {
            let plan = self.metadata.get_plan(ep.plan_id).await?;
            if plan.test_file.is_none() {
                return Err(LoadfleetError::Precondition(format!(
                    "Triggering plan aborted. There is no test file in plan {}",
                    plan.id
                )));
            }
            plans.push(plan);
        }
        if plans.is_empty() {
            return Err(LoadfleetError::Precondition(format!(
                "collection {} has no execution plans",
                collection.id
            )));
        }

        let run_id = self.metadata.start_run(collection.id).await?;
        let shares = split_collection_data(&collection);

        let mut configs = BTreeMap::new();
        let mut uploads = Vec::new();
        for d in &collection.data {
            info!(collection_id = collection.id, file = %d.filename, "Downloading collection data");
            uploads.push(UploadedFile {
                key: FormFileKey::CollectionData(d.filename.clone()),
                filename: d.filename.clone(),
                content: self.download(&d.filepath).await?,
            });
        }
        for ((ep, plan), share) in collection.execution_plans.iter().zip(&plans).zip(&shares) {
            let engines_config = prepare_plan(ep, plan, share, run_id);
            configs.insert(plan.id, PlanEnginesConfig::new(plan, ep, engines_config));
            uploads.extend(self.plan_uploads(plan).await?);
        }

        let ro = self.req_opts(collection.project_id).await?;
        self.client
            .trigger_collection(&ro, collection.id, &configs, uploads)
            .await?;
        for ep in &collection.execution_plans {
            self.metadata
                .add_running_plan(collection.id, ep.plan_id)
                .await?;
        }
        self.metadata.new_run(collection.id, run_id).await?;
        info!(collection_id = collection.id, run_id, "Collection triggered");
        Ok(run_id)
    }

    /// Merge the scheduler's view with the coordinator's health check and running-plan records.
    pub async fn collection_status(&self, collection: &Collection) -> LoadfleetResult<CollectionStatus> {
        let collection = self.load_plans(collection).await?;
        let eps = &collection.execution_plans;
        let reported = self
            .scheduler
            .collection_status(collection.project_id, collection.id, eps)
            .await?;
        let mut status = CollectionStatus {
            collection_id: collection.id,
            scraper_deployed: reported.scraper_deployed,
            plans: eps
                .iter()
                .map(|ep| {
                    let deployed = reported
                        .plans
                        .iter()
                        .find(|p| p.plan_id == ep.plan_id)
                        .map_or(0, |p| p.engines_deployed);
                    PlanStatus {
                        plan_id: ep.plan_id,
                        engines: ep.engines,
                        engines_deployed: deployed,
                        ..Default::default()
                    }
                })
                .collect(),
        };

        let healthy = match self.req_opts(collection.project_id).await {
            Ok(ro) => self
                .client
                .healthcheck(&ro, collection.id, collection.total_engines())
                .await
                .unwrap_or_else(|e| {
                    warn!(collection_id = collection.id, error = %e, "Coordinator health check failed");
                    false
                }),
            Err(e) => {
                warn!(collection_id = collection.id, error = %e, "Coordinator not reachable");
                false
            }
        };
        if !healthy {
            return Ok(status);
        }

        for ps in &mut status.plans {
            ps.engines_reachable = ps.engines == ps.engines_deployed && status.scraper_deployed;
            if let Some(rp) = self
                .metadata
                .get_running_plan(collection.id, ps.plan_id)
                .await?
            {
                ps.started_time = Some(rp.started_time);
                ps.in_progress = true;
            }
        }
        Ok(status)
    }

    /// Stop every plan of the collection and close out the current run.
    ///
    /// Running-plan rows and the run marker are always cleared, even when the
    /// coordinator call fails; that failure is still returned. Without
    /// `force`, a collection with no current run skips the coordinator call.
    pub async fn term_collection(&self, collection: &Collection, force: bool) -> LoadfleetResult<()> {
        let eps = self.metadata.execution_plans(collection.id).await?;
        let run_id = self.metadata.current_run(collection.id).await?;

        let plan_ids: Vec<PlanId> = eps.iter().map(|ep| ep.plan_id).collect();
        let remote = if force || run_id > 0 {
            async {
                let ro = self.req_opts(collection.project_id).await?;
                self.client
                    .term_collection(&ro, collection.id, &plan_ids)
                    .await
            }
            .await
        } else {
            Ok(())
        };
        if let Err(e) = &remote {
            error!(collection_id = collection.id, error = %e, "Coordinator terminate failed");
        }

        for plan_id in &plan_ids {
            if let Err(e) = self.metadata.delete_running_plan(collection.id, *plan_id).await {
                error!(collection_id = collection.id, plan_id, error = %e, "Failed to clear running plan");
            }
        }
        self.metadata.stop_run(collection.id).await?;
        if run_id > 0 {
            self.metadata.run_finish(collection.id, run_id).await?;
        }
        info!(collection_id = collection.id, run_id, "Collection terminated");
        remote
    }

    /// Terminate, delete every provisioned resource, then close the launch entry.
    ///
    /// Termination errors are logged and ignored. Usage is always computed;
    /// its error wins over a purge error.
    pub async fn term_and_purge_collection(&self, collection: &Collection) -> LoadfleetResult<()> {
        if let Err(e) = self.term_collection(collection, true).await {
            warn!(collection_id = collection.id, error = %e, "Ignoring terminate error during purge");
        }
        let purged = self.scheduler.purge_collection(collection.id).await;
        self.calculate_usage(collection.id).await?;
        purged
    }

    /// Ask every engine of every plan to open its metric stream.
    ///
    /// Plans are handled concurrently and so are the engines inside a plan.
    /// Returns the engines whose stream answered; a plan whose engines cannot
    /// be resolved, or an engine that refuses, is logged and left out.
    pub async fn subscribe_collection(&self, collection: &Collection) -> LoadfleetResult<Vec<EngineConnection>> {
        let eps = self.metadata.execution_plans(collection.id).await?;
        let api_key = self.scheduler.project_api_key(collection.project_id).await?;
        let per_plan = join_all(eps.iter().map(|ep| {
            let api_key = api_key.as_str();
            async move {
                let urls = match self
                    .scheduler
                    .fetch_engine_urls_by_plan(collection.project_id, collection.id, ep.plan_id, ep.engines)
                    .await
                {
                    Ok(urls) => urls,
                    Err(e) => {
                        warn!(collection_id = collection.id, plan_id = ep.plan_id, error = %e, "Plan subscription failed");
                        return Vec::new();
                    }
                };
                let engines = urls
                    .into_iter()
                    .enumerate()
                    .map(|(i, url)| EngineStream {
                        collection_id: collection.id,
                        plan_id: ep.plan_id,
                        engine_id: i as u32,
                        url,
                    })
                    .collect();
                self.streams.connect(engines, api_key).await
            }
        }))
        .await;

        let connected: Vec<EngineConnection> = per_plan.into_iter().flatten().collect();
        info!(collection_id = collection.id, engines = connected.len(), "Collection subscribed");
        Ok(connected)
    }

    /// Subscribe the collection and stream its engines' metrics to `client_id`.
    pub async fn open_metric_stream(
        &self,
        client_id: &str,
        collection: &Collection,
    ) -> LoadfleetResult<mpsc::Receiver<MetricEvent>> {
        let connections = self.subscribe_collection(collection).await?;
        Ok(self.streams.attach(client_id, connections).await)
    }

    /// Stop streaming to `client_id`. Returns whether it had a stream.
    pub async fn close_metric_stream(&self, client_id: &str) -> bool {
        self.streams.close(client_id).await
    }

    /// Bill the collection's current virtual users against its open launch entry.
    pub async fn calculate_usage(&self, collection_id: CollectionId) -> LoadfleetResult<u64> {
        let vu: u64 = self
            .metadata
            .execution_plans(collection_id)
            .await?
            .iter()
            .map(ExecutionPlan::virtual_users)
            .sum();
        self.metadata.mark_usage_finished(collection_id, vu).await?;
        Ok(vu)
    }

    async fn load_plans(&self, collection: &Collection) -> LoadfleetResult<Collection> {
        let execution_plans = self.metadata.execution_plans(collection.id).await?;
        Ok(Collection {
            execution_plans,
            ..collection.clone()
        })
    }

    async fn req_opts(&self, project_id: ProjectId) -> LoadfleetResult<ReqOpts> {
        let endpoint = self.scheduler.ingress_url(project_id).await?;
        if endpoint.is_empty() {
            return Err(LoadfleetError::Scheduler(format!(
                "project {project_id} has no coordinator ingress"
            )));
        }
        let api_key = self.scheduler.project_api_key(project_id).await?;
        Ok(ReqOpts::new(endpoint, api_key))
    }

    async fn download(&self, path: &str) -> LoadfleetResult<Vec<u8>> {
        self.storage
            .download(path)
            .await
            .map_err(|e| LoadfleetError::Storage(format!("Could not download file {path}: {e}")))
    }

    async fn plan_uploads(&self, plan: &Plan) -> LoadfleetResult<Vec<UploadedFile>> {
        let mut uploads = Vec::with_capacity(plan.data.len() + 1);
        if let Some(test_file) = &plan.test_file {
            uploads.push(UploadedFile {
                key: FormFileKey::Test(plan.id),
                filename: test_file.filename.clone(),
                content: self.download(&test_file.filepath).await?,
            });
        }
        for d in &plan.data {
            uploads.push(UploadedFile {
                key: FormFileKey::PlanData(plan.id),
                filename: d.filename.clone(),
                content: self.download(&d.filepath).await?,
            });
        }
        Ok(uploads)
    }
}

/// Deploy one plan's engines in order, retrying each engine independently.
async fn deploy_plan(
    scheduler: &dyn Scheduler,
    retry: &RetryPolicy,
    service_addr: &str,
    project_id: ProjectId,
    collection_id: CollectionId,
    ep: &ExecutionPlan,
) -> PlanDeployOutcome {
    let mut outcome = PlanDeployOutcome {
        plan_id: ep.plan_id,
        deployed: 0,
        requested: ep.engines,
        errors: Vec::new(),
    };
    for engine_id in 0..ep.engines {
        let engine = EngineOwnerRef {
            project_id,
            collection_id,
            plan_id: ep.plan_id,
            engine_id,
        };
        let engine = &engine;
        match retry
            .run("deploy_engine", move || scheduler.deploy_engine(engine, service_addr))
            .await
        {
            Ok(()) => outcome.deployed += 1,
            Err(e) => {
                error!(collection_id, plan_id = ep.plan_id, engine_id, error = %e, "Engine deploy failed");
                outcome.errors.push(format!("engine {engine_id}: {e}"));
            }
        }
    }
    outcome
}
