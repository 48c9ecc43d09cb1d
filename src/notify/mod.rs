//! Best-effort pub/sub notifier
//!
//! Every successful insert publishes the inserted batch on a topic derived
//! from the stream key: `/` becomes `.` and a trailing separator is
//! trimmed, so `user1/device/stream` publishes on `user1.device.stream`.
//! Subscriptions take NATS-style patterns: `*` matches exactly one segment
//! and `>` matches the remainder.
//!
//! Transport is Redis pub/sub on the same server as the hot cache. A Redis
//! glob cannot express "one segment", so the subscriber PSUBSCRIBEs a
//! widened glob and filters with an exact segment matcher before
//! delivering. Delivery is at-most-once: each subscriber owns a bounded
//! channel and messages to a full channel are dropped rather than stalling
//! the fanout task.

use crate::core::{DatapointArray, Error, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-subscriber buffer
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// One published insert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Unique event id
    pub id: String,

    /// Stream key the batch was inserted into
    pub stream: String,

    /// When the event was published
    pub published_at: DateTime<Utc>,

    /// The inserted datapoints
    pub points: DatapointArray,
}

/// Map a stream key to its pub/sub topic
pub fn topic_for(key: &str) -> String {
    let topic = key.replace('/', ".");
    topic.trim_end_matches('.').to_string()
}

/// Exact NATS-style pattern match over dot-separated segments
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut segs = topic.split('.');

    loop {
        match (pat.next(), segs.next()) {
            // '>' needs at least one remaining segment
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Widen a subscription pattern into a Redis glob. The glob may over-match
/// (Redis `*` crosses segment boundaries); [`topic_matches`] makes the
/// final call.
fn pattern_to_glob(pattern: &str) -> Result<String> {
    let segments: Vec<&str> = pattern.split('.').collect();
    let mut glob = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        match *seg {
            ">" => {
                if i + 1 != segments.len() {
                    return Err(Error::User(format!(
                        "'>' must end the pattern: {pattern}"
                    )));
                }
                glob.push("*".to_string());
            }
            "*" => glob.push("*".to_string()),
            literal => {
                let mut escaped = String::with_capacity(literal.len());
                for c in literal.chars() {
                    if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                        escaped.push('\\');
                    }
                    escaped.push(c);
                }
                glob.push(escaped);
            }
        }
    }
    Ok(glob.join("."))
}

/// A live subscription; dropping it ends delivery
pub struct Subscription {
    receiver: mpsc::Receiver<StreamEvent>,
}

impl Subscription {
    /// The next delivered event, or `None` once the notifier shut down
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Topic-based pub/sub over the cache's Redis server
#[derive(Clone)]
pub struct Notifier {
    client: redis::Client,
    publish_conn: ConnectionManager,
}

impl Notifier {
    /// Connect to the message bus
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publish_conn,
        })
    }

    /// Publish an inserted batch. Fire-and-forget: failures are reported to
    /// the caller but subscribers that miss the event are never retried.
    pub async fn publish(&self, key: &str, points: &DatapointArray) -> Result<()> {
        let topic = topic_for(key);
        let event = StreamEvent {
            id: uuid::Uuid::new_v4().to_string(),
            stream: key.to_string(),
            published_at: Utc::now(),
            points: points.clone(),
        };
        let payload = serde_json::to_vec(&event)
            .map_err(|e| Error::Backend(format!("unencodable event: {e}")))?;

        let mut conn = self.publish_conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Subscribe with the default buffer
    pub async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.subscribe_with_buffer(pattern, DEFAULT_SUBSCRIBER_BUFFER).await
    }

    /// Subscribe to all topics matching `pattern`. A subscriber that does
    /// not keep up loses messages; it never stalls producers.
    pub async fn subscribe_with_buffer(
        &self,
        pattern: &str,
        buffer: usize,
    ) -> Result<Subscription> {
        let glob = pattern_to_glob(pattern)?;
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.psubscribe(&glob).await?;

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if tx.is_closed() {
                    break;
                }
                let topic = msg.get_channel_name();
                if !topic_matches(&pattern, topic) {
                    continue;
                }
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(topic, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                let event: StreamEvent = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(topic, error = %e, "malformed stream event");
                        continue;
                    }
                };
                // Slow subscribers drop rather than stall
                if tx.try_send(event).is_err() {
                    debug!(topic, "subscriber behind, dropping event");
                }
            }
        });

        Ok(Subscription { receiver: rx })
    }
}
