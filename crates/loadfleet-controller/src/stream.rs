//! Registry of live metric-stream clients.
//!
//! Each client owns a set of reader tasks, one per engine, all sharing a
//! single [`CancellationToken`]. Closing the client cancels the token and
//! waits for the readers; control-plane state is never touched.

use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{connect, EngineConnection, EngineStream, MetricEvent};

/// Events buffered per client before readers wait on it.
pub const CLIENT_BUFFER: usize = 256;

struct StreamEntry {
    cancel: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

impl StreamEntry {
    async fn shutdown(self) {
        self.cancel.cancel();
        join_all(self.readers).await;
    }
}

/// Live metric-stream clients keyed by client id.
pub struct MetricStreams {
    http: reqwest::Client,
    clients: RwLock<HashMap<String, StreamEntry>>,
}

impl MetricStreams {
    /// An empty registry whose readers share `http`.
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Open every engine's stream concurrently. Engines that refuse or cannot
    /// be reached are logged and left out.
    pub async fn connect(&self, engines: Vec<EngineStream>, api_key: &str) -> Vec<EngineConnection> {
        join_all(engines.into_iter().map(|engine| async move {
            let url = engine.url.clone();
            let (collection_id, plan_id) = (engine.collection_id, engine.plan_id);
            connect(&self.http, engine, api_key).await.map_err(|e| {
                warn!(collection_id, plan_id, engine = %url, error = %e, "Engine subscription failed");
            })
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// Connect every engine in `engines` and stream them to `client_id`.
    pub async fn open(
        &self,
        client_id: &str,
        engines: Vec<EngineStream>,
        api_key: &str,
    ) -> mpsc::Receiver<MetricEvent> {
        let connections = self.connect(engines, api_key).await;
        self.attach(client_id, connections).await
    }

    /// Spawn one reader per connection on behalf of `client_id`.
    ///
    /// A stream already registered for the same client is replaced, and its
    /// readers are stopped before this returns.
    pub async fn attach(
        &self,
        client_id: &str,
        connections: Vec<EngineConnection>,
    ) -> mpsc::Receiver<MetricEvent> {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let cancel = CancellationToken::new();
        let readers = connections
            .into_iter()
            .map(|conn| {
                let tx = tx.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    let engine = conn.engine().clone();
                    if let Err(e) = conn.forward(tx, cancel).await {
                        warn!(
                            collection_id = engine.collection_id,
                            plan_id = engine.plan_id,
                            engine = %engine.url,
                            error = %e,
                            "Metric stream failed"
                        );
                    }
                })
            })
            .collect::<Vec<_>>();
        info!(client_id, readers = readers.len(), "Metric stream opened");

        let replaced = self
            .clients
            .write()
            .insert(client_id.to_string(), StreamEntry { cancel, readers });
        if let Some(old) = replaced {
            old.shutdown().await;
            info!(client_id, "Previous metric stream replaced");
        }
        rx
    }

    /// Stop every reader of `client_id`. Returns whether the client was registered.
    pub async fn close(&self, client_id: &str) -> bool {
        let Some(entry) = self.clients.write().remove(client_id) else {
            return false;
        };
        entry.shutdown().await;
        info!(client_id, "Metric stream closed");
        true
    }

    /// Whether `client_id` has a registered stream.
    pub fn is_open(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
