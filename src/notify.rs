use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Change events for renderers. Each carries the printer slot it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "index", rename_all = "snake_case")]
pub enum Notification {
    DataChanged(usize),
    StateChanged(usize),
    PopupChanged(usize),
    MinimalDataChanged(usize),
}

impl Notification {
    pub fn index(&self) -> usize {
        match self {
            Notification::DataChanged(i)
            | Notification::StateChanged(i)
            | Notification::PopupChanged(i)
            | Notification::MinimalDataChanged(i) => *i,
        }
    }
}

/// Where change events go. `emit` must never wait on a consumer.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Fan-out sink over a tokio broadcast channel.
///
/// Slow receivers lag and lose the oldest events rather than blocking the poller.
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationSink for BroadcastSink {
    fn emit(&self, notification: Notification) {
        // No receivers is fine
        if self.tx.send(notification).is_err() {
            debug!("Dropped {:?}: no subscribers", notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_fans_out() {
        let sink = BroadcastSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.emit(Notification::StateChanged(2));

        assert_eq!(a.recv().await.unwrap(), Notification::StateChanged(2));
        assert_eq!(b.recv().await.unwrap().index(), 2);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_block() {
        let sink = BroadcastSink::default();
        for i in 0..1000 {
            sink.emit(Notification::DataChanged(i % 8));
        }
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let sink = BroadcastSink::new(2);
        let mut rx = sink.subscribe();

        for i in 0..5 {
            sink.emit(Notification::DataChanged(i));
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), Notification::DataChanged(3));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Notification::PopupChanged(1)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "popup_changed", "index": 1}));
    }
}
