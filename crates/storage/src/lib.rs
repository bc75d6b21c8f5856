use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

mod commit;
pub mod error;
pub mod ids;
pub mod listen;
pub mod memory;
pub mod query;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::DocumentId;
pub use listen::{ListenWorker, Snapshot, SnapshotEvent, SnapshotStream, SnapshotSubscription, subscribe};
pub use memory::MemoryDocumentStore;
pub use query::{Direction, FieldFilter, OrderBy, Query};
pub use sqlite::SqliteDocumentStore;
pub use types::{
    ChangeKind, CollectionChanged, DocumentFields, FieldValue, StoreTimestamp, StoredDocument,
};

/// Buffered change notifications per receiver before it is reported as lagged.
pub const CHANGE_FEED_CAPACITY: usize = 256;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Schemaless document collections with a push-based change feed.
///
/// Every committed add or delete is announced on [`DocumentStore::changes`];
/// a delete that matched nothing commits nothing and announces nothing.
pub trait DocumentStore: Send + Sync {
    /// Appends a document, resolving `ServerTimestamp` sentinels to the commit time.
    fn add_document<'a>(
        &'a self,
        collection: &'a str,
        fields: DocumentFields,
    ) -> BoxFuture<'a, StorageResult<StoredDocument>>;

    /// Returns whether a document was removed.
    fn delete_document<'a>(
        &'a self,
        collection: &'a str,
        document_id: DocumentId,
    ) -> BoxFuture<'a, StorageResult<bool>>;

    fn run_query<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, StorageResult<Vec<StoredDocument>>>;

    fn changes(&self) -> broadcast::Receiver<CollectionChanged>;
}
