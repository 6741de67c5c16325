/// Run events delivered to live observers
///
/// The dispatcher emits `run_start`/`run_end` through a `FlowNotifier`; the
/// concrete transport is chosen by whoever builds the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventKind {
    RunStart,
    RunEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_version_id: String,
    pub run_id: String,
    pub node_id: Option<String>,
    pub kind: FlowEventKind,
    pub at: DateTime<Utc>,
}

impl FlowEvent {
    pub fn new(kind: FlowEventKind, flow_version_id: &str, run_id: &str, node_id: Option<&str>) -> Self {
        Self {
            flow_version_id: flow_version_id.to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.map(str::to_string),
            kind,
            at: Utc::now(),
        }
    }
}

/// Sink for run events
pub trait FlowNotifier: Send + Sync {
    fn notify(&self, event: FlowEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl FlowNotifier for NoopNotifier {
    fn notify(&self, _event: FlowEvent) {}
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::UnboundedSender<FlowEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FlowNotifier for ChannelNotifier {
    fn notify(&self, event: FlowEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("📭 Event receiver dropped, discarding flow event");
        }
    }
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<FlowEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl FlowNotifier for BroadcastNotifier {
    fn notify(&self, event: FlowEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_notifier_preserves_order() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        notifier.notify(FlowEvent::new(FlowEventKind::RunStart, "v1", "r1", Some("n1")));
        notifier.notify(FlowEvent::new(FlowEventKind::RunEnd, "v1", "r1", Some("n1")));

        assert_eq!(rx.recv().await.unwrap().kind, FlowEventKind::RunStart);
        assert_eq!(rx.recv().await.unwrap().kind, FlowEventKind::RunEnd);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let notifier = BroadcastNotifier::new(16);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.notify(FlowEvent::new(FlowEventKind::RunStart, "v1", "r1", None));

        assert_eq!(first.recv().await.unwrap().run_id, "r1");
        assert_eq!(second.recv().await.unwrap().run_id, "r1");
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        let event = FlowEvent::new(FlowEventKind::RunEnd, "v1", "r1", None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "run_end");
        assert!(json["node_id"].is_null());
    }
}
