//! Standing query subscriptions.
//!
//! A subscription re-runs its query whenever the store announces a change to the
//! subscribed collection and pushes the complete ordered result as one
//! [`Snapshot`]. Snapshots are full lists, never diffs, so a lagged change feed
//! is recovered by re-querying once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};

use super::DocumentStore;
use super::query::Query;
use super::types::StoredDocument;

pub type ListenWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Starts at 1 for the initial result and increments per emitted snapshot.
    pub sequence: u64,
    pub documents: Vec<StoredDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    Snapshot(Snapshot),
    Error { stage: &'static str, message: String },
}

/// Receiving half of a subscription. Dropping it releases the subscription.
pub struct SnapshotStream {
    query: Query,
    events: mpsc::UnboundedReceiver<SnapshotEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct SnapshotSubscription {
    pub stream: SnapshotStream,
    /// Must be spawned (or awaited) for snapshots to flow.
    pub worker: ListenWorker,
}

impl SnapshotStream {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn recv(&mut self) -> Option<SnapshotEvent> {
        self.events.recv().await
    }

    /// Returns `true` only for the call that actually released the subscription.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self
            .cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);
        self.events.close();
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Stream for SnapshotStream {
    type Item = SnapshotEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Opens a standing subscription for `query` on `store`.
pub fn subscribe(store: Arc<dyn DocumentStore>, query: Query) -> SnapshotSubscription {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let stream = SnapshotStream {
        query: query.clone(),
        events,
        cancel_tx: Some(cancel_tx),
    };
    let worker: ListenWorker = Box::pin(run_listen_worker(store, query, event_tx, cancel_rx));

    SnapshotSubscription { stream, worker }
}

async fn run_listen_worker(
    store: Arc<dyn DocumentStore>,
    query: Query,
    event_tx: mpsc::UnboundedSender<SnapshotEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    // Subscribe to the feed before the first query so no commit falls in between.
    let mut changes = store.changes();
    let mut sequence = 0_u64;

    if !emit_snapshot(store.as_ref(), &query, &event_tx, &mut sequence).await {
        return;
    }

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(collection = %query.collection, "subscription released");
                break;
            }
            change = changes.recv() => {
                match change {
                    Ok(change) if change.collection == query.collection => {
                        if !emit_snapshot(store.as_ref(), &query, &event_tx, &mut sequence).await {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            collection = %query.collection,
                            skipped,
                            "change feed lagged; re-querying"
                        );
                        if !emit_snapshot(store.as_ref(), &query, &event_tx, &mut sequence).await {
                            return;
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::error!(collection = %query.collection, "change feed closed");
                        let _ = event_tx.send(SnapshotEvent::Error {
                            stage: "listen-change-feed",
                            message: "store change feed closed".to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}

// Returns false once nobody is listening anymore.
async fn emit_snapshot(
    store: &dyn DocumentStore,
    query: &Query,
    event_tx: &mpsc::UnboundedSender<SnapshotEvent>,
    sequence: &mut u64,
) -> bool {
    let event = match store.run_query(query).await {
        Ok(documents) => {
            *sequence += 1;
            SnapshotEvent::Snapshot(Snapshot {
                sequence: *sequence,
                documents,
            })
        }
        Err(error) => {
            tracing::warn!(
                collection = %query.collection,
                error = %error,
                "snapshot query failed"
            );
            SnapshotEvent::Error {
                stage: "listen-run-query",
                message: error.to_string(),
            }
        }
    };

    event_tx.send(event).is_ok()
}
