//! Cache change notifications.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CacheEvent {
    #[serde(rename_all = "camelCase")]
    Added {
        digest: String,
        cache_size: u64,
        file_size: u64,
        source_file: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Removed {
        digest: String,
        cache_size: u64,
        file_size: u64,
    },
}

pub type CacheEventSender = mpsc::UnboundedSender<CacheEvent>;
pub type CacheEventReceiver = mpsc::UnboundedReceiver<CacheEvent>;

/// Channel for [`CacheEvent`]s.
pub fn channel() -> (CacheEventSender, CacheEventReceiver) {
    mpsc::unbounded_channel()
}

/// Log every event until the cache goes away.
pub async fn log_events(mut rx: CacheEventReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            CacheEvent::Added {
                digest,
                cache_size,
                file_size,
                source_file,
            } => tracing::debug!(
                %digest,
                cache_size,
                file_size,
                source_file = source_file.as_deref().unwrap_or(""),
                "object cached"
            ),
            CacheEvent::Removed {
                digest,
                cache_size,
                file_size,
            } => tracing::debug!(%digest, cache_size, file_size, "object evicted"),
        }
    }
}
