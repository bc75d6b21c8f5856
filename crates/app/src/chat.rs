use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anuja_storage::{DocumentId, StorageError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::watch;

use crate::records::{CHATS_COLLECTION, ConversationTurn, TurnSender};
use crate::session::{SessionContext, SessionId};
use crate::sync::ViewSync;

pub const DEFAULT_REPLY_DELAY: Duration = Duration::from_millis(1000);

const INPUT_PLACEHOLDER: &str = "{input}";

pub const REPLY_TEMPLATES: [&str; 4] = [
    "I understand you're asking about \"{input}\". That's a great question! I'm here to help you with AI-powered insights.",
    "Thanks for sharing! Regarding \"{input}\", I can help you explore this topic further with AI assistance.",
    "Interesting! \"{input}\" is something I can help you with. Let me provide some AI-driven insights.",
    "I've processed your query about \"{input}\". Here's what I can tell you based on my AI capabilities.",
];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("failed to write {sender:?} turn on `{stage}`: {source}"))]
    WriteTurn {
        stage: &'static str,
        sender: TurnSender,
        source: StorageError,
    },
    #[snafu(display("no reply templates configured"))]
    NoTemplates { stage: &'static str },
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Picks one template uniformly from `seed` and splices `input` in verbatim.
pub fn compose_reply(seed: u64, templates: &[&str], input: &str) -> Option<String> {
    if templates.is_empty() {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let template = templates[rng.random_range(0..templates.len())];
    Some(template.replace(INPUT_PLACEHOLDER, input))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Blank,
    SignedOut,
    AlreadyPending,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Ignored(IgnoreReason),
    Delivered {
        user_turn: DocumentId,
        reply_turn: DocumentId,
    },
    Failed(ChatError),
}

/// Writes a user turn, waits, then writes a templated assistant reply.
pub struct ChatTurnProducer {
    sync: ViewSync,
    reply_delay: Duration,
    rng: Mutex<StdRng>,
    pending: watch::Sender<bool>,
}

impl ChatTurnProducer {
    pub fn new(sync: ViewSync, reply_delay: Duration) -> Self {
        Self::with_rng(sync, reply_delay, StdRng::from_os_rng())
    }

    pub fn with_rng(sync: ViewSync, reply_delay: Duration, rng: StdRng) -> Self {
        let (pending, _) = watch::channel(false);
        Self {
            sync,
            reply_delay,
            rng: Mutex::new(rng),
            pending,
        }
    }

    pub fn pending(&self) -> bool {
        *self.pending.borrow()
    }

    pub fn watch_pending(&self) -> watch::Receiver<bool> {
        self.pending.subscribe()
    }

    pub async fn submit(&self, context: &SessionContext, text: &str) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SubmitOutcome::Ignored(IgnoreReason::Blank);
        }
        let Some(session) = context.session() else {
            return SubmitOutcome::Ignored(IgnoreReason::SignedOut);
        };

        let claimed = self.pending.send_if_modified(|pending| {
            if *pending {
                return false;
            }
            *pending = true;
            true
        });
        if !claimed {
            return SubmitOutcome::Ignored(IgnoreReason::AlreadyPending);
        }
        let _pending = PendingGuard {
            flag: &self.pending,
        };

        match self.deliver(session.id(), text).await {
            Ok((user_turn, reply_turn)) => SubmitOutcome::Delivered {
                user_turn,
                reply_turn,
            },
            Err(error) => {
                tracing::error!(owner_id = %session.id(), error = %error, "chat submission failed");
                SubmitOutcome::Failed(error)
            }
        }
    }

    async fn deliver(&self, owner: &SessionId, text: &str) -> ChatResult<(DocumentId, DocumentId)> {
        let user_turn = self
            .sync
            .write(
                CHATS_COLLECTION,
                ConversationTurn::new_fields(owner, text, TurnSender::User),
            )
            .await
            .context(WriteTurnSnafu {
                stage: "chat-write-user-turn",
                sender: TurnSender::User,
            })?;
        tracing::debug!(owner_id = %owner, document_id = %user_turn, "user turn written");

        tokio::time::sleep(self.reply_delay).await;

        let reply = compose_reply(self.next_seed(), &REPLY_TEMPLATES, text).context(
            NoTemplatesSnafu {
                stage: "chat-compose-reply",
            },
        )?;
        let reply_turn = self
            .sync
            .write(
                CHATS_COLLECTION,
                ConversationTurn::new_fields(owner, &reply, TurnSender::Assistant),
            )
            .await
            .inspect_err(|_| {
                tracing::warn!(
                    owner_id = %owner,
                    document_id = %user_turn,
                    "user turn left without a reply"
                );
            })
            .context(WriteTurnSnafu {
                stage: "chat-write-reply-turn",
                sender: TurnSender::Assistant,
            })?;

        Ok((user_turn, reply_turn))
    }

    fn next_seed(&self) -> u64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random()
    }
}

struct PendingGuard<'a> {
    flag: &'a watch::Sender<bool>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.flag.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anuja_storage::{
        BoxFuture, CollectionChanged, DocumentFields, DocumentStore, FieldValue,
        MemoryDocumentStore, Query, StorageResult, StoredDocument,
    };
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    use super::*;
    use crate::records::{SENDER_FIELD, TEXT_FIELD};
    use crate::session::Session;

    /// Accepts the first `allowed` writes, then fails every add.
    struct WriteBudgetStore {
        inner: MemoryDocumentStore,
        allowed: AtomicUsize,
    }

    impl WriteBudgetStore {
        fn new(allowed: usize) -> Self {
            Self {
                inner: MemoryDocumentStore::new(),
                allowed: AtomicUsize::new(allowed),
            }
        }
    }

    impl DocumentStore for WriteBudgetStore {
        fn add_document<'a>(
            &'a self,
            collection: &'a str,
            fields: DocumentFields,
        ) -> BoxFuture<'a, StorageResult<StoredDocument>> {
            let granted = self
                .allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if granted {
                return self.inner.add_document(collection, fields);
            }
            Box::pin(async {
                Err(StorageError::InvariantViolation {
                    stage: "test-write-budget",
                    details: "write rejected".to_string(),
                })
            })
        }

        fn delete_document<'a>(
            &'a self,
            collection: &'a str,
            document_id: DocumentId,
        ) -> BoxFuture<'a, StorageResult<bool>> {
            self.inner.delete_document(collection, document_id)
        }

        fn run_query<'a>(
            &'a self,
            query: &'a Query,
        ) -> BoxFuture<'a, StorageResult<Vec<StoredDocument>>> {
            self.inner.run_query(query)
        }

        fn changes(&self) -> broadcast::Receiver<CollectionChanged> {
            self.inner.changes()
        }
    }

    fn signed_in(id: &str) -> SessionContext {
        SessionContext::SignedIn(Session::new(SessionId::new(id), format!("{id}@example.com")))
    }

    fn producer(store: Arc<dyn DocumentStore>) -> Arc<ChatTurnProducer> {
        Arc::new(ChatTurnProducer::with_rng(
            ViewSync::new(store),
            DEFAULT_REPLY_DELAY,
            StdRng::seed_from_u64(7),
        ))
    }

    async fn chat_documents(store: &dyn DocumentStore) -> Vec<StoredDocument> {
        store
            .run_query(&Query::collection(CHATS_COLLECTION))
            .await
            .expect("query")
    }

    #[test]
    fn reply_quotes_input_verbatim_and_is_seed_stable() {
        let input = "  spaced \"quoted\" input ";
        let first = compose_reply(42, &REPLY_TEMPLATES, input).expect("templates present");
        let again = compose_reply(42, &REPLY_TEMPLATES, input).expect("templates present");

        assert_eq!(first, again);
        assert!(first.contains(&format!("\"{input}\"")));
        assert!(!first.contains(INPUT_PLACEHOLDER));
    }

    #[test]
    fn every_template_is_reachable() {
        let mut seen = [false; REPLY_TEMPLATES.len()];
        for seed in 0..512 {
            let reply = compose_reply(seed, &REPLY_TEMPLATES, "x").expect("templates present");
            let index = REPLY_TEMPLATES
                .iter()
                .position(|template| template.replace(INPUT_PLACEHOLDER, "x") == reply)
                .expect("reply comes from a template");
            seen[index] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }

    #[test]
    fn no_templates_means_no_reply() {
        assert_eq!(compose_reply(1, &[], "x"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn user_turn_is_immediate_and_reply_follows_after_delay() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let producer = producer(store.clone());
        let mut changes = store.changes();

        let task = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.submit(&signed_in("u1"), "  hello ").await })
        };

        changes.recv().await.expect("user turn announced");
        let written = Instant::now();
        let documents = chat_documents(store.as_ref()).await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].get(TEXT_FIELD), Some(&FieldValue::from("hello")));
        assert_eq!(documents[0].get(SENDER_FIELD), Some(&FieldValue::from("user")));
        assert!(producer.pending());

        changes.recv().await.expect("reply announced");
        assert!(written.elapsed() >= DEFAULT_REPLY_DELAY);

        let outcome = task.await.expect("submit task");
        assert!(matches!(outcome, SubmitOutcome::Delivered { .. }));
        assert!(!producer.pending());

        let documents = chat_documents(store.as_ref()).await;
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1].get(SENDER_FIELD), Some(&FieldValue::from("ai")));
        let reply = documents[1]
            .get(TEXT_FIELD)
            .and_then(FieldValue::as_text)
            .expect("reply text");
        assert!(reply.contains("\"hello\""));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_or_signed_out_submissions_write_nothing() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let producer = producer(store.clone());

        let blank = producer.submit(&signed_in("u1"), " \n\t ").await;
        assert!(matches!(blank, SubmitOutcome::Ignored(IgnoreReason::Blank)));

        let anonymous = producer.submit(&SessionContext::SignedOut, "hello").await;
        assert!(matches!(anonymous, SubmitOutcome::Ignored(IgnoreReason::SignedOut)));

        assert!(chat_documents(store.as_ref()).await.is_empty());
        assert!(!producer.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn second_submission_while_pending_is_ignored() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let producer = producer(store.clone());
        let mut changes = store.changes();

        let task = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.submit(&signed_in("u1"), "first").await })
        };
        changes.recv().await.expect("user turn announced");

        let second = producer.submit(&signed_in("u1"), "second").await;
        assert!(matches!(second, SubmitOutcome::Ignored(IgnoreReason::AlreadyPending)));

        task.await.expect("submit task");
        assert_eq!(chat_documents(store.as_ref()).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_user_write_clears_pending() {
        let store: Arc<dyn DocumentStore> = Arc::new(WriteBudgetStore::new(0));
        let producer = producer(store.clone());

        let outcome = producer.submit(&signed_in("u1"), "hello").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Failed(ChatError::WriteTurn {
                sender: TurnSender::User,
                ..
            })
        ));
        assert!(!producer.pending());
        assert!(chat_documents(store.as_ref()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_leaves_the_user_turn_in_place() {
        let store: Arc<dyn DocumentStore> = Arc::new(WriteBudgetStore::new(1));
        let producer = producer(store.clone());

        let outcome = producer.submit(&signed_in("u1"), "hello").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Failed(ChatError::WriteTurn {
                sender: TurnSender::Assistant,
                ..
            })
        ));
        assert!(!producer.pending());

        let documents = chat_documents(store.as_ref()).await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].get(SENDER_FIELD), Some(&FieldValue::from("user")));
    }
}
