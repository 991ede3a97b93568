//! Engine side of the broker: a WebSocket subscription to one collection topic.

use futures_util::StreamExt;
use loadfleet_core::{collection_topic, CollectionId, LoadfleetError, LoadfleetResult, Payload};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// A connected engine waiting for start/stop payloads.
pub struct BrokerSubscriber {
    topic: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl BrokerSubscriber {
    /// Subscribe to `collection:<id>` on the coordinator at `base_url`.
    ///
    /// `http(s)://` base URLs are mapped to `ws(s)://`.
    pub async fn connect(
        base_url: &str,
        api_key: &str,
        collection_id: CollectionId,
    ) -> LoadfleetResult<Self> {
        let topic = collection_topic(collection_id);
        let base = base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let url = format!("{base}/pubsub/{topic}");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| LoadfleetError::Broker(format!("invalid broker url {url}: {e}")))?;
        if !api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| LoadfleetError::Broker(e.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| LoadfleetError::Broker(format!("Failed to subscribe to {topic}: {e}")))?;
        info!(topic = %topic, "Subscribed");
        Ok(Self { topic, stream })
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next payload. `None` once the coordinator closes the stream.
    pub async fn next_payload(&mut self) -> Option<LoadfleetResult<Payload>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(Payload::from_json(text.as_str()).map_err(LoadfleetError::from));
                }
                Ok(Message::Close(_)) => return None,
                Ok(other) => debug!(topic = %self.topic, kind = ?other, "Ignoring frame"),
                Err(e) => return Some(Err(LoadfleetError::Broker(e.to_string()))),
            }
        }
        None
    }

    /// Unsubscribe.
    pub async fn close(mut self) -> LoadfleetResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| LoadfleetError::Broker(e.to_string()))
    }
}
