//! Generic change subscription.
//!
//! One [`ChangeHandler`] implementation per entity type replaces a family of
//! near-identical listener types: [`subscribe`] drives any handler from any
//! change stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::change::Change;
use crate::task::TaskResult;

/// Receiving side of a change stream.
pub type ChangeStream<T> = mpsc::Receiver<Change<T>>;

/// Sending side of a change stream.
pub type ChangeSink<T> = mpsc::Sender<Change<T>>;

/// Creates a bounded change stream.
pub fn change_stream<T>(capacity: usize) -> (ChangeSink<T>, ChangeStream<T>) {
    mpsc::channel(capacity)
}

/// Reacts to classified changes of entity type `T`.
///
/// `on_change` must not block: it updates derived state synchronously and
/// hands any slow work to a scheduler. Errors are confined to the change
/// that produced them.
pub trait ChangeHandler<T>: Send + Sync {
    /// Returns the handler name (for logging).
    fn name(&self) -> &str;

    /// Processes one change notification.
    fn on_change(&self, change: Change<T>) -> TaskResult<()>;
}

/// Counters reported when a subscription ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Notifications handled successfully
    pub processed: u64,
    /// Notifications whose handler returned an error
    pub failed: u64,
}

/// Drives `handler` from `stream` until the stream closes.
///
/// Must be called from within a tokio runtime.
pub fn subscribe<T, H>(mut stream: ChangeStream<T>, handler: Arc<H>) -> JoinHandle<SubscriptionStats>
where
    T: Send + 'static,
    H: ChangeHandler<T> + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut stats = SubscriptionStats::default();
        while let Some(change) = stream.recv().await {
            match handler.on_change(change) {
                Ok(()) => stats.processed += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!(handler = handler.name(), error = %e, "change handler failed");
                }
            }
        }
        debug!(
            handler = handler.name(),
            processed = stats.processed,
            failed = stats.failed,
            "change stream closed"
        );
        stats
    })
}
