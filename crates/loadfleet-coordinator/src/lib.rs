//! Per-project coordinator for loadfleet.
//!
//! Bridges the controller's HTTP control requests to the engine fleet:
//! engines subscribe to a collection topic on the [`Broker`], the
//! [`Inventory`] tracks which engines are addressable, and [`PlanProgress`]
//! gates when a plan counts as fully started or fully stopped.
//!
//! # Main types
//!
//! - [`Coordinator`] — Wires the shared state and builds the HTTP router.
//! - [`Inventory`] — Ready engine endpoints, rebuilt by polling an [`EndpointSource`].
//! - [`PlanProgress`] — Per-engine running flags for each (collection, plan).
//! - [`Broker`] / [`BrokerSubscriber`] — Topic fan-out and its engine-side consumer.
//! - [`CoordinatorClient`] — Typed HTTP client for the control API.

/// Control API handlers.
pub mod api;
/// Topic fan-out to connected engines.
pub mod broker;
/// HTTP client for the control API.
pub mod client;
/// Multipart form parsing and per-kind test file rendering.
pub mod files;
/// Ready engine endpoints.
pub mod inventory;
/// Bearer-key authentication.
pub mod middleware;
/// Per-plan engine running flags.
pub mod progress;
/// Router and shared state.
pub mod server;
/// On-disk layout of a plan's files.
pub mod storage;
/// Engine-side broker consumer.
pub mod subscriber;
/// Listener TLS.
pub mod tls;

pub use broker::{Broker, Subscription};
pub use client::{CoordinatorClient, ReqOpts};
pub use files::{FormFileKey, UploadedFile};
pub use inventory::{EndpointAddress, EndpointGroup, EndpointSource, FileEndpointSource, Inventory};
pub use middleware::AuthConfig;
pub use progress::{PlanProgress, Progress};
pub use server::{AppState, CoordinatorServer};
pub use storage::PlanFiles;
pub use subscriber::BrokerSubscriber;
pub use tls::TlsConfig;

use axum::Router;
use loadfleet_core::{LoadfleetResult, ProjectId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runtime settings for one coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Project whose engines this coordinator drives.
    pub project_id: ProjectId,
    /// Shared bearer key. Empty disables auth.
    pub api_key: String,
    /// Where uploaded test and data files are stored and served from.
    pub files_root: PathBuf,
    /// Interval between inventory poll cycles.
    pub inventory_interval: Duration,
}

/// A coordinator's shared state.
pub struct Coordinator {
    options: CoordinatorOptions,
    state: Arc<AppState>,
}

impl Coordinator {
    /// Build the coordinator around an endpoint source.
    pub fn new(options: CoordinatorOptions, source: Arc<dyn EndpointSource>) -> LoadfleetResult<Self> {
        Self::with_progress(options, source, Arc::new(PlanProgress::new()))
    }

    /// Build the coordinator with a caller-supplied progress table.
    pub fn with_progress(
        options: CoordinatorOptions,
        source: Arc<dyn EndpointSource>,
        progress: Arc<PlanProgress>,
    ) -> LoadfleetResult<Self> {
        let inventory = Arc::new(Inventory::with_interval(source, options.inventory_interval));
        let state = Arc::new(AppState::new(
            Broker::new(),
            inventory,
            progress,
            options.files_root.clone(),
        )?);
        Ok(Self { options, state })
    }

    /// The state handlers share.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// The HTTP router serving the control API, broker, files and stream proxy.
    pub fn router(&self) -> Router {
        CoordinatorServer::build(self.state.clone(), AuthConfig::new(self.options.api_key.clone()))
    }

    /// Start the inventory refresh loop in the background.
    pub fn spawn_inventory(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inventory = self.state.inventory.clone();
        let project_id = self.options.project_id;
        tokio::spawn(async move { inventory.refresh(project_id, shutdown).await })
    }
}
