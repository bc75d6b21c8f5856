use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use anuja_storage::{
    Direction, DocumentFields, DocumentId, DocumentStore, FieldValue, Query, SnapshotEvent,
    SnapshotSubscription, SqliteDocumentStore, StorageError, StoredDocument, subscribe,
};

const COLLECTION: &str = "qa_images";
const OWNER_FIELD: &str = "userId";
const ORDER_FIELD: &str = "timestamp";

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    OwnerFilter,
    Ordering,
    DeleteSilent,
    ReopenMonotonic,
    SubscriptionEcho,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "owner_filter" => Some(Self::OwnerFilter),
            "ordering" => Some(Self::Ordering),
            "delete_silent" => Some(Self::DeleteSilent),
            "reopen_monotonic" => Some(Self::ReopenMonotonic),
            "subscription_echo" => Some(Self::SubscriptionEcho),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::OwnerFilter => "owner_filter",
            Self::Ordering => "ordering",
            Self::DeleteSilent => "delete_silent",
            Self::ReopenMonotonic => "reopen_monotonic",
            Self::SubscriptionEcho => "subscription_echo",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("document store call failed: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::OwnerFilter => run_owner_filter(require_db_path(&args, "owner_filter")?).await,
        Scenario::Ordering => run_ordering(require_db_path(&args, "ordering")?).await,
        Scenario::DeleteSilent => {
            run_delete_silent(require_db_path(&args, "delete_silent")?).await
        }
        Scenario::ReopenMonotonic => {
            run_reopen_monotonic(require_db_path(&args, "reopen_monotonic")?).await
        }
        Scenario::SubscriptionEcho => {
            run_subscription_echo(require_db_path(&args, "subscription_echo")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_owner_filter(path).await?;
        run_ordering(path).await?;
        run_delete_silent(path).await?;
        run_reopen_monotonic(path).await?;
        run_subscription_echo(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let id = DocumentId::new_v7();
    let decoded = id.to_string().parse::<DocumentId>().context(StoreSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;
    check(decoded == id, "id_roundtrip", "format/parse roundtrip mismatch")?;

    println!("document_id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let rejected = matches!(
        "not-a-valid-uuid".parse::<DocumentId>(),
        Err(StorageError::InvalidId { .. })
    );
    println!("invalid_id_error={rejected}");
    check(rejected, "id_invalid", "malformed id was accepted")?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let store = open_fresh(db_path, "scenario-schema-init-open").await?;
    let pool = store.pool();

    let table_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'documents'",
    )
    .fetch_one(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;
    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();

    println!("schema_ok={}", table_count == 1);
    println!("journal_mode={journal_mode}");
    check(table_count == 1, "schema_init", "documents table missing")?;
    check(journal_mode == "wal", "schema_init", "journal mode is not wal")?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_owner_filter(db_path: &str) -> RunnerResult<()> {
    let store = open_fresh(db_path, "scenario-owner-filter-open").await?;
    add(&store, "u1", "mine").await?;
    add(&store, "u2", "foreign").await?;
    add(&store, "u1", "mine too").await?;

    let documents = query_owner(&store, "u1", Direction::Ascending).await?;
    let only_owner = documents
        .iter()
        .all(|document| document.get(OWNER_FIELD) == Some(&FieldValue::from("u1")));
    println!("owner_filter_count={}", documents.len());
    check(
        only_owner && documents.len() == 2,
        "owner_filter",
        "owner filter leaked or dropped documents",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_ordering(db_path: &str) -> RunnerResult<()> {
    let store = open_fresh(db_path, "scenario-ordering-open").await?;
    add(&store, "u1", "w1").await?;
    add(&store, "u1", "w2").await?;

    let ascending_documents = query_owner(&store, "u1", Direction::Ascending).await?;
    let descending_documents = query_owner(&store, "u1", Direction::Descending).await?;
    let ascending = prompts(&ascending_documents);
    let descending = prompts(&descending_documents);
    println!("ascending={}", ascending.join(","));
    println!("descending={}", descending.join(","));
    check(ascending == ["w1", "w2"], "ordering", "ascending order is wrong")?;
    check(descending == ["w2", "w1"], "ordering", "descending order is wrong")?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_delete_silent(db_path: &str) -> RunnerResult<()> {
    let store = open_fresh(db_path, "scenario-delete-silent-open").await?;
    let kept = add(&store, "u1", "kept").await?;
    let mut changes = store.changes();

    let removed_unknown = store
        .delete_document(COLLECTION, DocumentId::new_v7())
        .await
        .context(StoreSnafu {
            stage: "scenario-delete-silent-unknown",
        })?;
    let announced = changes.try_recv().is_ok();
    println!("unknown_removed={removed_unknown}");
    println!("unknown_announced={announced}");
    check(
        !removed_unknown && !announced,
        "delete_silent",
        "deleting an unknown id was not silent",
    )?;

    let removed = store
        .delete_document(COLLECTION, kept.id)
        .await
        .context(StoreSnafu {
            stage: "scenario-delete-silent-existing",
        })?;
    let remaining = query_owner(&store, "u1", Direction::Ascending).await?;
    check(
        removed && remaining.is_empty(),
        "delete_silent",
        "existing document survived delete",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_reopen_monotonic(db_path: &str) -> RunnerResult<()> {
    let store = open_fresh(db_path, "scenario-reopen-open").await?;
    let before = add(&store, "u1", "before").await?;
    store.pool().close().await;
    drop(store);

    let reopened = SqliteDocumentStore::open(db_path)
        .await
        .context(StoreSnafu {
            stage: "scenario-reopen-reopen",
        })?;
    let after = add(&reopened, "u1", "after").await?;

    let increasing = match (commit_millis(&before), commit_millis(&after)) {
        (Some(before), Some(after)) => after > before,
        _ => false,
    };
    println!("timestamps_increasing={increasing}");
    check(
        increasing,
        "reopen_monotonic",
        "commit clock went backwards across reopen",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_subscription_echo(db_path: &str) -> RunnerResult<()> {
    let store: Arc<dyn DocumentStore> =
        Arc::new(open_fresh(db_path, "scenario-subscription-echo-open").await?);
    let query = owner_query("u1", Direction::Ascending);
    let SnapshotSubscription { mut stream, worker } = subscribe(store.clone(), query);
    let worker = tokio::spawn(worker);

    let initial = next_documents(&mut stream, "initial").await?;
    check(initial.is_empty(), "subscription_echo", "fresh store was not empty")?;

    add(store.as_ref(), "u1", "echoed").await?;
    let echoed = next_documents(&mut stream, "after-write").await?;
    println!("echoed_count={}", echoed.len());
    check(
        prompts(&echoed) == ["echoed"],
        "subscription_echo",
        "write was not echoed as a full snapshot",
    )?;

    let first_cancel = stream.cancel();
    let second_cancel = stream.cancel();
    println!("cancel_idempotent={}", first_cancel && !second_cancel);
    check(
        first_cancel && !second_cancel,
        "subscription_echo",
        "cancel was not idempotent",
    )?;
    let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;

    println!("runner_ok=true");
    Ok(())
}

async fn next_documents(
    stream: &mut anuja_storage::SnapshotStream,
    step: &'static str,
) -> RunnerResult<Vec<StoredDocument>> {
    match tokio::time::timeout(Duration::from_secs(5), stream.recv()).await {
        Ok(Some(SnapshotEvent::Snapshot(snapshot))) => Ok(snapshot.documents),
        other => ScenarioFailedSnafu {
            stage: "scenario-subscription-next",
            scenario: "subscription_echo",
            reason: format!("expected a snapshot at {step}, got {other:?}"),
        }
        .fail(),
    }
}

async fn open_fresh(db_path: &str, stage: &'static str) -> RunnerResult<SqliteDocumentStore> {
    reset_sqlite_files(db_path)?;
    SqliteDocumentStore::open(db_path)
        .await
        .context(StoreSnafu { stage })
}

async fn add(store: &dyn DocumentStore, owner: &str, prompt: &str) -> RunnerResult<StoredDocument> {
    let mut fields = DocumentFields::new();
    fields.insert(OWNER_FIELD.to_string(), FieldValue::from(owner));
    fields.insert("prompt".to_string(), FieldValue::from(prompt));
    fields.insert(ORDER_FIELD.to_string(), FieldValue::ServerTimestamp);

    store
        .add_document(COLLECTION, fields)
        .await
        .context(StoreSnafu {
            stage: "scenario-add-document",
        })
}

fn owner_query(owner: &str, direction: Direction) -> Query {
    Query::collection(COLLECTION)
        .where_eq(OWNER_FIELD, owner)
        .order_by(ORDER_FIELD, direction)
}

async fn query_owner(
    store: &dyn DocumentStore,
    owner: &str,
    direction: Direction,
) -> RunnerResult<Vec<StoredDocument>> {
    store
        .run_query(&owner_query(owner, direction))
        .await
        .context(StoreSnafu {
            stage: "scenario-query-owner",
        })
}

fn prompts(documents: &[StoredDocument]) -> Vec<&str> {
    documents
        .iter()
        .filter_map(|document| document.get("prompt").and_then(FieldValue::as_text))
        .collect()
}

fn commit_millis(document: &StoredDocument) -> Option<i64> {
    document
        .get(ORDER_FIELD)
        .and_then(FieldValue::as_timestamp)
        .map(|stamp| stamp.as_millis())
}

fn check(condition: bool, scenario: &'static str, reason: &str) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason.to_string(),
    }
    .fail()
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "scenario-reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "scenario-reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "scenario-reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
