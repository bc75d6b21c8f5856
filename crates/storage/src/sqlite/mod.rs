use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::{Mutex, broadcast};

use super::commit::{CommitClock, resolve_server_timestamps, validate_write};
use super::error::{
    CreateSqliteDirectorySnafu, DecodeFieldsSnafu, EncodeFieldsSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::DocumentId;
use super::query::Query;
use super::types::{ChangeKind, CollectionChanged, DocumentFields, StoreTimestamp, StoredDocument};
use super::{BoxFuture, CHANGE_FEED_CAPACITY, DocumentStore};

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    collection: String,
    fields: String,
}

/// Document store persisted in a single SQLite table, fields kept as JSON.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    database_url: String,
    clock: CommitClock,
    // Serializes commits so row order and commit timestamps never disagree.
    write_lock: Mutex<()>,
    changes: broadcast::Sender<CollectionChanged>,
}

impl SqliteDocumentStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            // An in-memory database lives exactly as long as its one connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let latest_commit =
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(committed_at), 0) FROM documents")
                .fetch_one(&pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-open-latest-commit",
                })?;

        tracing::info!(database_url = %database_url, "opened sqlite document store");

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            pool,
            database_url,
            clock: CommitClock::new(StoreTimestamp::from_millis(latest_commit)),
            write_lock: Mutex::new(()),
            changes,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn announce(&self, collection: &str, document_id: DocumentId, kind: ChangeKind) {
        let _ = self.changes.send(CollectionChanged {
            collection: collection.to_string(),
            document_id,
            kind,
        });
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn add_document<'a>(
        &'a self,
        collection: &'a str,
        fields: DocumentFields,
    ) -> BoxFuture<'a, StorageResult<StoredDocument>> {
        Box::pin(async move {
            validate_write(collection, &fields)?;

            let document = {
                let _commit = self.write_lock.lock().await;
                let committed_at = self.clock.next();
                let fields = resolve_server_timestamps(fields, committed_at);
                let encoded = serde_json::to_string(&fields).context(EncodeFieldsSnafu {
                    stage: "document-add-encode",
                    collection: collection.to_string(),
                })?;
                let document_id = DocumentId::new_v7();

                sqlx::query(
                    "INSERT INTO documents (id, collection, fields, committed_at) VALUES (?, ?, ?, ?)",
                )
                .bind(document_id.to_string())
                .bind(collection)
                .bind(encoded)
                .bind(committed_at.as_millis())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "document-add-insert",
                })?;

                StoredDocument {
                    id: document_id,
                    collection: collection.to_string(),
                    fields,
                }
            };

            tracing::trace!(collection, document_id = %document.id, "sqlite store committed add");
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
            let result = {
                let _commit = self.write_lock.lock().await;
                sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                    .bind(collection)
                    .bind(document_id.to_string())
                    .execute(&self.pool)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "document-delete-apply",
                    })?
            };

            let removed = result.rows_affected() > 0;
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
            let rows = match text_filter(query) {
                Some((path, value)) => sqlx::query_as::<_, DocumentRow>(
                    "SELECT id, collection, fields FROM documents \
                     WHERE collection = ? AND json_extract(fields, ?) = ? ORDER BY seq ASC",
                )
                .bind(query.collection.as_str())
                .bind(path)
                .bind(value)
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "document-query-load-filtered",
                })?,
                None => sqlx::query_as::<_, DocumentRow>(
                    "SELECT id, collection, fields FROM documents WHERE collection = ? ORDER BY seq ASC",
                )
                .bind(query.collection.as_str())
                .fetch_all(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "document-query-load",
                })?,
            };

            let documents = rows
                .into_iter()
                .map(document_row_to_record)
                .collect::<StorageResult<Vec<_>>>()?;

            Ok(query.apply(documents))
        })
    }

    fn changes(&self) -> broadcast::Receiver<CollectionChanged> {
        self.changes.subscribe()
    }
}

// JSON path and value for a text equality filter SQLite can evaluate itself.
// Other filters load the whole collection; `Query::apply` re-checks either way.
fn text_filter(query: &Query) -> Option<(String, &str)> {
    let filter = query.filter.as_ref()?;
    let value = filter.value.as_text()?;
    if filter.field.contains(['"', '\\']) {
        return None;
    }
    Some((format!("$.\"{}\".value", filter.field), value))
}

fn document_row_to_record(row: DocumentRow) -> StorageResult<StoredDocument> {
    let id = DocumentId::parse(&row.id)?;
    let fields = serde_json::from_str::<DocumentFields>(&row.fields).context(DecodeFieldsSnafu {
        stage: "document-row-decode-fields",
        document_id: row.id.clone(),
    })?;

    Ok(StoredDocument {
        id,
        collection: row.collection,
        fields,
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
