use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};

use super::commit::{CommitClock, resolve_server_timestamps, validate_write};
use super::error::StorageResult;
use super::ids::DocumentId;
use super::query::Query;
use super::types::{ChangeKind, CollectionChanged, DocumentFields, StoreTimestamp, StoredDocument};
use super::{BoxFuture, CHANGE_FEED_CAPACITY, DocumentStore};

/// Process-local store. Each collection keeps its documents in commit order.
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<StoredDocument>>>,
    clock: CommitClock,
    changes: broadcast::Sender<CollectionChanged>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            clock: CommitClock::new(StoreTimestamp::from_millis(0)),
            changes,
        }
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }

    fn announce(&self, collection: &str, document_id: DocumentId, kind: ChangeKind) {
        // No receivers simply means nobody is subscribed yet.
        let _ = self.changes.send(CollectionChanged {
            collection: collection.to_string(),
            document_id,
            kind,
        });
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn add_document<'a>(
        &'a self,
        collection: &'a str,
        fields: DocumentFields,
    ) -> BoxFuture<'a, StorageResult<StoredDocument>> {
        Box::pin(async move {
            validate_write(collection, &fields)?;

            let document = {
                let mut collections = self.collections.write().await;
                // Stamp under the write lock so commit order and timestamp order agree.
                let committed_at = self.clock.next();
                let document = StoredDocument {
                    id: DocumentId::new_v7(),
                    collection: collection.to_string(),
                    fields: resolve_server_timestamps(fields, committed_at),
                };
                collections
                    .entry(collection.to_string())
                    .or_default()
                    .push(document.clone());
                document
            };

            tracing::trace!(collection, document_id = %document.id, "memory store committed add");
            self.announce(collection, document.id, ChangeKind::Added);
            Ok(document)
        })
    }

    fn delete_document<'a>(
        &'a self,
        collection: &'a str,
        document_id: DocumentId,
    ) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let removed = {
                let mut collections = self.collections.write().await;
                match collections.get_mut(collection) {
                    Some(documents) => {
                        let before = documents.len();
                        documents.retain(|document| document.id != document_id);
                        documents.len() != before
                    }
                    None => false,
                }
            };

            if removed {
                self.announce(collection, document_id, ChangeKind::Removed);
            }
            Ok(removed)
        })
    }

    fn run_query<'a>(
        &'a self,
        query: &'a Query,
    ) -> BoxFuture<'a, StorageResult<Vec<StoredDocument>>> {
        Box::pin(async move {
            let documents = self
                .collections
                .read()
                .await
                .get(&query.collection)
                .cloned()
                .unwrap_or_default();
            Ok(query.apply(documents))
        })
    }

    fn changes(&self) -> broadcast::Receiver<CollectionChanged> {
        self.changes.subscribe()
    }
}
