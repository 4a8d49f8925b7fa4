//! Read-only monitor feed.
//!
//! Events are broadcast to every subscribed monitor connection. A monitor
//! that falls more than the channel capacity behind skips the events it
//! missed. New monitors first receive a `builderAdded` for every builder
//! already connected.

use fisk_protocol::{BuilderSummary, Connection, MonitorEvent};
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone)]
pub struct MonitorFeed {
    tx: broadcast::Sender<MonitorEvent>,
}

impl MonitorFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to current subscribers. Nobody listening is not an error.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Stream the feed to one monitor until either side goes away.
///
/// `snapshot` must be taken together with subscribing `events`, so that
/// no builder is missed or announced twice.
pub async fn stream(
    mut conn: Connection,
    snapshot: Vec<BuilderSummary>,
    mut events: broadcast::Receiver<MonitorEvent>,
) {
    let sender = conn.sender();
    for builder in snapshot {
        if sender.send_json(&MonitorEvent::BuilderAdded { builder }).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if sender.send_json(&event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = ?conn.peer_addr(), skipped, "monitor lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            inbound = conn.recv() => match inbound {
                None => break,
                Some(Err(e)) => {
                    tracing::debug!(peer = ?conn.peer_addr(), error = %e, "monitor connection failed");
                    break;
                }
                Some(Ok(_)) => tracing::debug!(peer = ?conn.peer_addr(), "ignoring message from monitor"),
            },
        }
    }
    conn.close().await;
}
