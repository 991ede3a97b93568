//! Reading an engine's live metric stream.

use futures_util::StreamExt;
use loadfleet_core::{CollectionId, LoadfleetError, LoadfleetResult, PlanId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One engine a metric stream can be opened against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStream {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Plan the engine runs.
    pub plan_id: PlanId,
    /// Ordinal within the plan.
    pub engine_id: u32,
    /// Engine base URL.
    pub url: String,
}

impl EngineStream {
    fn stream_url(&self) -> String {
        format!("{}/stream", self.url.trim_end_matches('/'))
    }
}

/// A metric line emitted by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEvent {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Plan the engine runs.
    pub plan_id: PlanId,
    /// Ordinal within the plan.
    pub engine_id: u32,
    /// The line as the engine sent it, minus the `data:` prefix.
    pub raw: String,
}

/// An engine whose `GET /stream` answered with a success status.
///
/// The body has not been read yet; [`EngineConnection::forward`] consumes it.
#[derive(Debug)]
pub struct EngineConnection {
    engine: EngineStream,
    response: reqwest::Response,
}

/// Ask `engine` to open its metric stream.
pub async fn connect(
    http: &reqwest::Client,
    engine: EngineStream,
    api_key: &str,
) -> LoadfleetResult<EngineConnection> {
    let response = http
        .get(engine.stream_url())
        .bearer_auth(api_key)
        .send()
        .await
        .map_err(|e| LoadfleetError::Http(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(LoadfleetError::Http(format!(
            "engine {} stream returned {status}",
            engine.url
        )));
    }
    Ok(EngineConnection { engine, response })
}

impl EngineConnection {
    /// The engine this connection belongs to.
    pub fn engine(&self) -> &EngineStream {
        &self.engine
    }

    /// Forward `data:` lines from the stream into `tx`.
    ///
    /// Returns when the stream ends, `cancel` fires, or the receiver goes away.
    pub async fn forward(
        self,
        tx: mpsc::Sender<MetricEvent>,
        cancel: CancellationToken,
    ) -> LoadfleetResult<()> {
        let Self { engine, response } = self;
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| LoadfleetError::Http(format!("Stream read error: {e}")))?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                let Some(raw) = parse_data_line(&line) else {
                    continue;
                };
                let event = MetricEvent {
                    collection_id: engine.collection_id,
                    plan_id: engine.plan_id,
                    engine_id: engine.engine_id,
                    raw: raw.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        debug!(engine = %engine.url, "Metric stream finished");
        Ok(())
    }
}

/// Raw stream bytes waiting for their line terminator.
///
/// Lines are decoded only once complete, so a multi-byte character split
/// across network chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

fn parse_data_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data:").map(str::trim_start)
}
