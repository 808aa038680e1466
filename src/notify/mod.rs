/// Outbound notification and archive collaborators
///
/// Both sinks are fire-and-forget from the core's perspective: a failed
/// delivery is logged and swallowed, never propagated into the state
/// transition that triggered it.
use crate::orders::{Order, OriginContext};
use async_trait::async_trait;
use std::sync::Arc;

/// Where a notification should land
#[derive(Debug, Clone)]
pub enum NotifyTarget {
    /// Direct message to one account
    Account(String),
    /// The channel an order originated from
    Origin(OriginContext),
    /// Staff broadcast (new requests, leaderboards)
    Staff,
}

/// Notification sink collaborator
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, target: NotifyTarget, message: &str) -> anyhow::Result<()>;
}

/// Archive sink collaborator. `sync` upserts the archive record for an
/// order and returns its reference; passing an order that already carries
/// an `archive_ref` must update that record in place.
#[async_trait]
pub trait OrderArchive: Send + Sync {
    async fn sync(&self, order: &Order) -> anyhow::Result<String>;
}

/// Send a notification, logging and swallowing any failure
pub async fn notify_best_effort(
    sink: &Arc<dyn NotificationSink>,
    target: NotifyTarget,
    message: &str,
) {
    if let Err(e) = sink.notify(target.clone(), message).await {
        tracing::warn!("Notification dropped ({:?}): {}", target, e);
    }
}

/// Tracing-backed sink for standalone operation
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, target: NotifyTarget, message: &str) -> anyhow::Result<()> {
        tracing::info!("notify {:?}: {}", target, message);
        Ok(())
    }
}

/// Tracing-backed archive for standalone operation
pub struct LogArchive;

#[async_trait]
impl OrderArchive for LogArchive {
    async fn sync(&self, order: &Order) -> anyhow::Result<String> {
        let archive_ref = order
            .archive_ref
            .clone()
            .unwrap_or_else(|| format!("archive-{}", order.order_id));
        tracing::info!(
            "archive {}: order {} now {}",
            archive_ref,
            order.order_id,
            order.status.as_str()
        );
        Ok(archive_ref)
    }
}
