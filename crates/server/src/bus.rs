//! In-process event bus.
//!
//! Push notifications from upstream land here (via whatever transport the
//! deployment wires in) and wake the orchestrator out of its rest period.
//! Subscribers register a topic filter and a callback; delivery runs on a
//! dedicated task per subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BusEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub struct InProcessBus {
    tx: broadcast::Sender<BusEvent>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver an event to every current subscriber. Returns the number of
    /// subscribers that will see it.
    pub fn publish(&self, event: BusEvent) -> usize {
        debug!(topic = %event.topic, "publishing bus event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Invoke `on_event` for every published event whose topic is in
    /// `topics`. The returned handle can be aborted to unsubscribe.
    pub fn subscribe<F>(
        &self,
        topics: Vec<String>,
        subscriber_id: impl Into<String>,
        on_event: F,
    ) -> JoinHandle<()>
    where
        F: Fn(BusEvent) + Send + Sync + 'static,
    {
        let subscriber_id = subscriber_id.into();
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if topics.iter().any(|t| t == &event.topic) {
                            on_event(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            subscriber = %subscriber_id,
                            missed,
                            "bus subscriber lagged — events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscriber_only_sees_its_topics() {
        let bus = InProcessBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let _handle = bus.subscribe(
            vec!["choreo.push.prod".to_string()],
            "test-subscriber",
            move |event| {
                sink.lock().unwrap().push(event.topic);
            },
        );
        // Give the subscriber task a chance to start listening.
        tokio::time::sleep(Duration::from_millis(10)).await;

        bus.publish(BusEvent {
            topic: "choreo.push.prod".to_string(),
            payload: serde_json::Value::Null,
        });
        bus.publish(BusEvent {
            topic: "choreo.push.staging".to_string(),
            payload: serde_json::Value::Null,
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["choreo.push.prod"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = InProcessBus::new(4);
        let delivered = bus.publish(BusEvent {
            topic: "nobody.home".to_string(),
            payload: serde_json::Value::Null,
        });
        assert_eq!(delivered, 0);
    }
}
