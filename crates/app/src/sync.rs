//! View synchronization: live, per-owner projections of document collections.
//!
//! A [`LiveQuery`] holds one standing subscription and replaces its whole item
//! list on every snapshot the store pushes. Writes go straight to the store and
//! are never applied locally; the echoed snapshot is the only way a projection
//! changes.

use std::sync::Arc;

use anuja_storage::{
    Direction, DocumentFields, DocumentId, DocumentStore, FieldValue, Query, SnapshotEvent,
    SnapshotStream, SnapshotSubscription, StorageResult, StoredDocument, subscribe,
};
use chrono::{DateTime, Utc};
use snafu::{OptionExt, Snafu};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::SessionId;

pub const OWNER_FIELD: &str = "userId";
pub const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("document '{document_id}' has no '{field}' field"))]
    MissingField {
        document_id: DocumentId,
        field: &'static str,
    },
    #[snafu(display("document '{document_id}' field '{field}' is not {expected}"))]
    WrongType {
        document_id: DocumentId,
        field: &'static str,
        expected: &'static str,
    },
    #[snafu(display("document '{document_id}' field '{field}' is outside the representable time range"))]
    TimestampOutOfRange {
        document_id: DocumentId,
        field: &'static str,
    },
}

/// Maps a stored document to a typed record. One implementation per collection.
pub trait FromDocument: Sized {
    fn from_document(document: &StoredDocument) -> Result<Self, DecodeError>;
}

pub fn read_text(document: &StoredDocument, field: &'static str) -> Result<String, DecodeError> {
    let value = document.get(field).context(MissingFieldSnafu {
        document_id: document.id,
        field,
    })?;
    value.as_text().map(str::to_string).context(WrongTypeSnafu {
        document_id: document.id,
        field,
        expected: "text",
    })
}

/// Reads a store-native timestamp and converts it to local UTC time.
pub fn read_timestamp(
    document: &StoredDocument,
    field: &'static str,
) -> Result<DateTime<Utc>, DecodeError> {
    let value = document.get(field).context(MissingFieldSnafu {
        document_id: document.id,
        field,
    })?;
    let stamp = value.as_timestamp().context(WrongTypeSnafu {
        document_id: document.id,
        field,
        expected: "a timestamp",
    })?;
    stamp.to_datetime().context(TimestampOutOfRangeSnafu {
        document_id: document.id,
        field,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Unsubscribed,
    Subscribing,
    Active,
    Error,
}

/// What a view renders: the latest mapped list plus subscription status.
#[derive(Debug)]
pub struct Projection<T> {
    pub state: SyncState,
    /// Incremented on every applied snapshot.
    pub revision: u64,
    pub items: Arc<[T]>,
    pub last_error: Option<String>,
}

impl<T> Clone for Projection<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            revision: self.revision,
            items: Arc::clone(&self.items),
            last_error: self.last_error.clone(),
        }
    }
}

impl<T> Projection<T> {
    fn subscribing() -> Self {
        Self {
            state: SyncState::Subscribing,
            revision: 0,
            items: Arc::from(Vec::new()),
            last_error: None,
        }
    }
}

struct LiveTasks {
    listener: JoinHandle<()>,
    projector: JoinHandle<()>,
}

/// A live projection of one query. Dropping it unsubscribes.
pub struct LiveQuery<T> {
    query: Query,
    view: watch::Receiver<Projection<T>>,
    publisher: Arc<watch::Sender<Projection<T>>>,
    tasks: Option<LiveTasks>,
}

impl<T> LiveQuery<T>
where
    T: FromDocument + Send + Sync + 'static,
{
    /// Opens the subscription. Must be called inside a tokio runtime.
    pub fn open(store: Arc<dyn DocumentStore>, query: Query) -> Self {
        let (publisher, view) = watch::channel(Projection::subscribing());
        let publisher = Arc::new(publisher);
        let SnapshotSubscription { stream, worker } = subscribe(store, query.clone());

        let listener = tokio::spawn(worker);
        let projector = tokio::spawn(run_projector(stream, Arc::clone(&publisher)));

        tracing::debug!(collection = %query.collection, "live query opened");
        Self {
            query,
            view,
            publisher,
            tasks: Some(LiveTasks {
                listener,
                projector,
            }),
        }
    }
}

impl<T> LiveQuery<T> {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn state(&self) -> SyncState {
        self.view.borrow().state
    }

    pub fn items(&self) -> Arc<[T]> {
        Arc::clone(&self.view.borrow().items)
    }

    pub fn snapshot(&self) -> Projection<T> {
        self.view.borrow().clone()
    }

    /// Waits until the projection changes and returns the new value.
    pub async fn changed(&mut self) -> Projection<T> {
        // The sender lives in `self`, so this only errors if we are being torn down.
        let _ = self.view.changed().await;
        self.view.borrow_and_update().clone()
    }

    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&Projection<T>) -> bool,
    ) -> Projection<T> {
        if let Ok(projection) = self
            .view
            .wait_for(|projection| predicate(projection))
            .await
            .map(|current| (*current).clone())
        {
            return projection;
        }
        self.view.borrow().clone()
    }

    /// Releases the subscription. Returns `false` if it was already released.
    pub fn unsubscribe(&mut self) -> bool {
        let Some(tasks) = self.tasks.take() else {
            return false;
        };

        // Dropping the stream inside the projector signals the listener as well.
        tasks.projector.abort();
        tasks.listener.abort();
        self.publisher.send_modify(|projection| {
            projection.state = SyncState::Unsubscribed;
        });

        tracing::debug!(collection = %self.query.collection, "live query released");
        true
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn run_projector<T: FromDocument>(
    mut stream: SnapshotStream,
    publisher: Arc<watch::Sender<Projection<T>>>,
) {
    while let Some(event) = stream.recv().await {
        match event {
            SnapshotEvent::Snapshot(snapshot) => {
                let items: Arc<[T]> =
                    map_documents(&stream.query().collection, &snapshot.documents).into();
                publisher.send_if_modified(|projection| {
                    // A released projection stays frozen even if one last event slips in.
                    if projection.state == SyncState::Unsubscribed {
                        return false;
                    }
                    projection.items = items;
                    projection.state = SyncState::Active;
                    projection.revision += 1;
                    projection.last_error = None;
                    true
                });
            }
            SnapshotEvent::Error { stage, message } => {
                tracing::warn!(
                    collection = %stream.query().collection,
                    stage,
                    error = %message,
                    "subscription reported a transport failure"
                );
                publisher.send_if_modified(|projection| {
                    if projection.state == SyncState::Unsubscribed {
                        return false;
                    }
                    projection.state = SyncState::Error;
                    projection.last_error = Some(message);
                    true
                });
            }
        }
    }
}

fn map_documents<T: FromDocument>(collection: &str, documents: &[StoredDocument]) -> Vec<T> {
    documents
        .iter()
        .filter_map(|document| match T::from_document(document) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(collection, error = %error, "skipping undecodable document");
                None
            }
        })
        .collect()
}

/// Entry point for views: opens owner-scoped projections and issues writes.
#[derive(Clone)]
pub struct ViewSync {
    store: Arc<dyn DocumentStore>,
}

impl ViewSync {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn subscribe<T>(
        &self,
        collection: &str,
        owner: &SessionId,
        order_field: &str,
        direction: Direction,
    ) -> LiveQuery<T>
    where
        T: FromDocument + Send + Sync + 'static,
    {
        let query = Query::collection(collection)
            .where_eq(OWNER_FIELD, owner.as_str())
            .order_by(order_field, direction);
        LiveQuery::open(Arc::clone(&self.store), query)
    }

    /// Appends a document stamped with the store's commit time. Open projections
    /// pick it up from the next snapshot, not from this call.
    pub async fn write(
        &self,
        collection: &str,
        mut fields: DocumentFields,
    ) -> StorageResult<DocumentId> {
        fields.insert(TIMESTAMP_FIELD.to_string(), FieldValue::ServerTimestamp);
        let stored = self.store.add_document(collection, fields).await?;
        Ok(stored.id)
    }

    pub async fn delete(&self, collection: &str, document_id: DocumentId) -> StorageResult<bool> {
        self.store.delete_document(collection, document_id).await
    }
}
