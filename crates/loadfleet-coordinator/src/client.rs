//! HTTP client for the coordinator control API, used by the controller and engines.

use loadfleet_core::{
    CollectionId, LoadfleetError, LoadfleetResult, PlanEnginesConfig, PlanId,
};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::files::{UploadedFile, ENGINE_DATA_FIELD};

/// Where a project's coordinator lives and how to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqOpts {
    /// Host (`coordinator.example.com`) or base URL (`http://127.0.0.1:8080`).
    /// A bare host is reached over HTTPS.
    pub endpoint: String,
    /// Bearer key for the project.
    pub api_key: String,
}

impl ReqOpts {
    /// Options for the coordinator at `endpoint`.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        }
    }

    fn collection_url(&self, collection_id: CollectionId) -> String {
        format!("{}/api/collections/{collection_id}", self.base_url())
    }

    fn plan_url(&self, collection_id: CollectionId, plan_id: PlanId) -> String {
        format!("{}/{plan_id}", self.collection_url(collection_id))
    }
}

/// Thin typed wrapper over the coordinator's HTTP API.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
}

impl CoordinatorClient {
    /// Client with the default request timeout.
    pub fn new() -> LoadfleetResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LoadfleetError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http))
    }

    /// Reuse an existing HTTP client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Upload per-plan engine configs and files, and start the collection.
    ///
    /// A 409 (engines not all connected) is reported as a precondition failure.
    pub async fn trigger_collection(
        &self,
        ro: &ReqOpts,
        collection_id: CollectionId,
        configs: &BTreeMap<PlanId, PlanEnginesConfig>,
        files: Vec<UploadedFile>,
    ) -> LoadfleetResult<()> {
        let mut form = Form::new().text(ENGINE_DATA_FIELD, serde_json::to_string(configs)?);
        for file in files {
            let part = Part::bytes(file.content).file_name(file.filename);
            form = form.part(file.key.to_string(), part);
        }
        let req = self
            .http
            .post(ro.collection_url(collection_id))
            .multipart(form);
        self.send(ro, req).await.map(drop)
    }

    /// Whether subscribers and ready endpoints both equal `engines`.
    pub async fn healthcheck(
        &self,
        ro: &ReqOpts,
        collection_id: CollectionId,
        engines: u32,
    ) -> LoadfleetResult<bool> {
        let req = self
            .http
            .get(ro.collection_url(collection_id))
            .query(&[("engines", engines)]);
        self.status_ok(ro, req).await
    }

    /// Whether all `engines` of the plan report running.
    pub async fn progress_check(
        &self,
        ro: &ReqOpts,
        collection_id: CollectionId,
        plan_id: PlanId,
        engines: u32,
    ) -> LoadfleetResult<bool> {
        let req = self
            .http
            .get(ro.plan_url(collection_id, plan_id))
            .query(&[("engines", engines)]);
        self.status_ok(ro, req).await
    }

    /// Engine self-report.
    pub async fn report_progress(
        &self,
        ro: &ReqOpts,
        collection_id: CollectionId,
        plan_id: PlanId,
        engine_id: u32,
        running: bool,
    ) -> LoadfleetResult<()> {
        let url = format!("{}/{engine_id}", ro.plan_url(collection_id, plan_id));
        let running = if running { "true" } else { "false" };
        let req = self.http.put(url).form(&[("running", running)]);
        self.send(ro, req).await.map(drop)
    }

    /// Broadcast stop to the listed plans.
    pub async fn term_collection(
        &self,
        ro: &ReqOpts,
        collection_id: CollectionId,
        plan_ids: &[PlanId],
    ) -> LoadfleetResult<()> {
        let plans: Vec<String> = plan_ids.iter().map(ToString::to_string).collect();
        let req = self
            .http
            .delete(ro.collection_url(collection_id))
            .query(&[("plans", plans.join(","))]);
        self.send(ro, req).await.map(drop)
    }

    /// Broadcast stop to one plan.
    pub async fn term_plan(
        &self,
        ro: &ReqOpts,
        collection_id: CollectionId,
        plan_id: PlanId,
    ) -> LoadfleetResult<()> {
        let req = self.http.delete(ro.plan_url(collection_id, plan_id));
        self.send(ro, req).await.map(drop)
    }

    /// Download an artifact from the coordinator's file server.
    pub async fn fetch_file(&self, ro: &ReqOpts, relative_path: &str) -> LoadfleetResult<Vec<u8>> {
        let url = format!(
            "{}/files/{}",
            ro.base_url(),
            relative_path.trim_start_matches('/')
        );
        let resp = self.send(ro, self.http.get(url)).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| LoadfleetError::Http(e.to_string()))?;
        Ok(body.to_vec())
    }

    async fn execute(&self, ro: &ReqOpts, req: RequestBuilder) -> LoadfleetResult<reqwest::Response> {
        let resp = req
            .bearer_auth(&ro.api_key)
            .send()
            .await
            .map_err(|e| LoadfleetError::Http(e.to_string()))?;
        debug!(url = %resp.url(), status = resp.status().as_u16(), "Coordinator response");
        Ok(resp)
    }

    async fn send(&self, ro: &ReqOpts, req: RequestBuilder) -> LoadfleetResult<reqwest::Response> {
        let resp = self.execute(ro, req).await?;
        if resp.status().as_u16() < 400 {
            return Ok(resp);
        }
        Err(status_error(resp).await)
    }

    async fn status_ok(&self, ro: &ReqOpts, req: RequestBuilder) -> LoadfleetResult<bool> {
        let resp = self.execute(ro, req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.as_u16() < 400 => Ok(true),
            _ => Err(status_error(resp).await),
        }
    }
}

async fn status_error(resp: reqwest::Response) -> LoadfleetError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
        return LoadfleetError::Precondition(body.trim().to_string());
    }
    LoadfleetError::Coordinator(format!(
        "resp: {}, status_code: {}",
        body.trim(),
        status.as_u16()
    ))
}
