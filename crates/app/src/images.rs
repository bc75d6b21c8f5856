use std::io;
use std::path::{Path, PathBuf};

use anuja_imagine::{ImageClient, ImagineError, download_file_name};
use anuja_storage::{DocumentId, StorageError};
use chrono::Utc;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::watch;

use crate::chat::IgnoreReason;
use crate::records::{GeneratedImageRecord, IMAGES_COLLECTION, ImageLoad, ImageLoads};
use crate::session::{SessionContext, SessionId};
use crate::sync::ViewSync;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GalleryError {
    #[snafu(display("failed to persist image record on `{stage}`: {source}"))]
    PersistImage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to delete image '{document_id}' on `{stage}`: {source}"))]
    DeleteImage {
        stage: &'static str,
        document_id: DocumentId,
        source: StorageError,
    },
    #[snafu(display("failed to fetch image on `{stage}`: {source}"))]
    FetchImage {
        stage: &'static str,
        source: ImagineError,
    },
    #[snafu(display("failed to create download directory {} on `{stage}`: {source}", path.display()))]
    CreateDownloadDirectory {
        stage: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[snafu(display("failed to write {} on `{stage}`: {source}", path.display()))]
    WriteDownload {
        stage: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[snafu(display("there is no generated image to download"))]
    NothingToDownload { stage: &'static str },
}

pub type GalleryResult<T> = Result<T, GalleryError>;

#[derive(Debug)]
pub enum GenerateOutcome {
    Ignored(IgnoreReason),
    Saved { document_id: DocumentId, url: String },
    Failed(GalleryError),
}

#[derive(Debug, Clone)]
struct Preview {
    owner: SessionId,
    url: String,
}

/// Turns prompts into image URLs, records them and saves local copies.
///
/// The preview and the per-URL load outcomes belong to whoever is signed in;
/// [`ImageRequestor::clear_session_state`] drops them when the session changes.
pub struct ImageRequestor {
    sync: ViewSync,
    client: ImageClient,
    download_dir: PathBuf,
    generating: watch::Sender<bool>,
    preview: watch::Sender<Option<Preview>>,
    loads: watch::Sender<ImageLoads>,
}

impl ImageRequestor {
    pub fn new(sync: ViewSync, client: ImageClient, download_dir: impl Into<PathBuf>) -> Self {
        let (generating, _) = watch::channel(false);
        let (preview, _) = watch::channel(None);
        let (loads, _) = watch::channel(ImageLoads::default());
        Self {
            sync,
            client,
            download_dir: download_dir.into(),
            generating,
            preview,
            loads,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn generating(&self) -> bool {
        *self.generating.borrow()
    }

    pub fn watch_generating(&self) -> watch::Receiver<bool> {
        self.generating.subscribe()
    }

    /// URL of the image `context` generated most recently, if any.
    pub fn preview(&self, context: &SessionContext) -> Option<String> {
        let session = context.session()?;
        self.preview
            .borrow()
            .as_ref()
            .filter(|preview| &preview.owner == session.id())
            .map(|preview| preview.url.clone())
    }

    pub fn image_loads(&self) -> ImageLoads {
        self.loads.borrow().clone()
    }

    pub fn watch_image_loads(&self) -> watch::Receiver<ImageLoads> {
        self.loads.subscribe()
    }

    /// Forgets the preview and load outcomes of the previous session.
    pub fn clear_session_state(&self) {
        self.preview.send_if_modified(|preview| preview.take().is_some());
        self.loads.send_if_modified(ImageLoads::clear);
    }

    /// Builds the image URL for `prompt` and records it. The URL is not
    /// checked; whether it renders is only known when something loads it.
    pub async fn generate(&self, context: &SessionContext, prompt: &str) -> GenerateOutcome {
        if prompt.trim().is_empty() {
            return GenerateOutcome::Ignored(IgnoreReason::Blank);
        }
        let Some(session) = context.session() else {
            return GenerateOutcome::Ignored(IgnoreReason::SignedOut);
        };

        let claimed = self.generating.send_if_modified(|generating| {
            if *generating {
                return false;
            }
            *generating = true;
            true
        });
        if !claimed {
            return GenerateOutcome::Ignored(IgnoreReason::AlreadyPending);
        }

        let url = self.client.prompt_url(prompt);
        self.preview.send_replace(Some(Preview {
            owner: session.id().clone(),
            url: url.clone(),
        }));

        let written = self
            .sync
            .write(
                IMAGES_COLLECTION,
                GeneratedImageRecord::new_fields(session.id(), &url, prompt),
            )
            .await
            .context(PersistImageSnafu {
                stage: "image-persist-record",
            });
        self.generating.send_replace(false);

        match written {
            Ok(document_id) => {
                tracing::info!(owner_id = %session.id(), document_id = %document_id, "image recorded");
                GenerateOutcome::Saved { document_id, url }
            }
            Err(error) => {
                tracing::error!(owner_id = %session.id(), error = %error, "image generation failed");
                GenerateOutcome::Failed(error)
            }
        }
    }

    /// Fetches `url` and writes it as `anuja-ai-{millis}.png` in the download directory.
    ///
    /// The fetch doubles as the load check: its outcome is kept in
    /// [`ImageRequestor::image_loads`] so a broken URL renders as the placeholder.
    pub async fn download(&self, url: &str) -> GalleryResult<PathBuf> {
        let result = self.save_copy(url).await;
        match &result {
            Ok(path) => {
                self.record_load(url, ImageLoad::Loaded);
                tracing::info!(path = %path.display(), "image downloaded");
            }
            Err(error) => {
                if matches!(error, GalleryError::FetchImage { .. }) {
                    self.record_load(url, ImageLoad::Failed);
                }
                tracing::error!(url, error = %error, "image download failed");
            }
        }
        result
    }

    pub async fn download_record(&self, record: &GeneratedImageRecord) -> GalleryResult<PathBuf> {
        self.download(&record.url).await
    }

    pub async fn download_preview(&self, context: &SessionContext) -> GalleryResult<PathBuf> {
        let url = self.preview(context).context(NothingToDownloadSnafu {
            stage: "image-download-preview",
        })?;
        self.download(&url).await
    }

    /// Removes a gallery entry. An unknown id is reported as `false`.
    pub async fn delete(&self, document_id: DocumentId) -> GalleryResult<bool> {
        let removed = self
            .sync
            .delete(IMAGES_COLLECTION, document_id)
            .await
            .context(DeleteImageSnafu {
                stage: "image-delete-record",
                document_id,
            })
            .inspect_err(|error| tracing::error!(error = %error, "image delete failed"))?;

        if removed {
            tracing::info!(document_id = %document_id, "image deleted");
        } else {
            tracing::debug!(document_id = %document_id, "image delete matched nothing");
        }
        Ok(removed)
    }

    fn record_load(&self, url: &str, load: ImageLoad) {
        self.loads.send_if_modified(|loads| loads.record(url, load));
    }

    async fn save_copy(&self, url: &str) -> GalleryResult<PathBuf> {
        let bytes = self.client.fetch_image(url).await.context(FetchImageSnafu {
            stage: "image-download-fetch",
        })?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .context(CreateDownloadDirectorySnafu {
                stage: "image-download-create-dir",
                path: self.download_dir.clone(),
            })?;

        let path = self
            .download_dir
            .join(download_file_name(Utc::now().timestamp_millis()));
        tokio::fs::write(&path, &bytes)
            .await
            .context(WriteDownloadSnafu {
                stage: "image-download-write",
                path: path.clone(),
            })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anuja_imagine::{ImageEndpoint, PLACEHOLDER_IMAGE_URL};
    use anuja_storage::{DocumentStore, FieldValue, MemoryDocumentStore, Query, StoredDocument};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::console;
    use crate::records::{PROMPT_FIELD, URL_FIELD};
    use crate::session::{Session, SessionId};

    fn signed_in(id: &str) -> SessionContext {
        SessionContext::SignedIn(Session::new(SessionId::new(id), format!("{id}@example.com")))
    }

    fn requestor(store: Arc<dyn DocumentStore>, base: &str, dir: &Path) -> ImageRequestor {
        let client =
            ImageClient::new(ImageEndpoint::new(base, 1024, 1024, true)).expect("http client");
        ImageRequestor::new(ViewSync::new(store), client, dir)
    }

    async fn image_documents(store: &dyn DocumentStore) -> Vec<StoredDocument> {
        store
            .run_query(&Query::collection(IMAGES_COLLECTION))
            .await
            .expect("query")
    }

    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0_u8; 2048];
                let _ = socket.read(&mut request).await;
                let head = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn generated_record_keeps_prompt_verbatim_and_encodes_url_once() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store.clone(), "https://image.pollinations.ai", dir.path());
        let prompt = " a cat & a dog / 50% ";

        let owner = signed_in("u1");
        let outcome = requestor.generate(&owner, prompt).await;
        let GenerateOutcome::Saved { url, .. } = outcome else {
            panic!("expected saved outcome, got {outcome:?}");
        };
        assert_eq!(
            url,
            format!(
                "https://image.pollinations.ai/prompt/{}?width=1024&height=1024&nologo=true",
                urlencoding::encode(prompt)
            )
        );
        assert_eq!(requestor.preview(&owner).as_deref(), Some(url.as_str()));
        assert!(!requestor.generating());

        let documents = image_documents(store.as_ref()).await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].get(PROMPT_FIELD), Some(&FieldValue::from(prompt)));
        assert_eq!(documents[0].get(URL_FIELD), Some(&FieldValue::from(url.as_str())));
    }

    #[tokio::test]
    async fn blank_prompt_or_no_session_writes_nothing() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store.clone(), "https://image.pollinations.ai", dir.path());

        let blank = requestor.generate(&signed_in("u1"), "   ").await;
        assert!(matches!(blank, GenerateOutcome::Ignored(IgnoreReason::Blank)));
        let anonymous = requestor.generate(&SessionContext::SignedOut, "a cat").await;
        assert!(matches!(anonymous, GenerateOutcome::Ignored(IgnoreReason::SignedOut)));

        assert!(image_documents(store.as_ref()).await.is_empty());
        assert_eq!(requestor.preview(&signed_in("u1")), None);
    }

    #[tokio::test]
    async fn download_writes_a_timestamped_png() {
        let base = serve_once("200 OK", b"\x89PNG-bytes").await;
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("downloads");
        let requestor = requestor(store, &base, &target);

        let url = format!("{base}/prompt/sunset");
        let path = requestor.download(&url).await.expect("download succeeds");

        let name = path.file_name().and_then(|name| name.to_str()).expect("file name");
        assert!(name.starts_with("anuja-ai-"));
        assert!(name.ends_with(".png"));
        assert_eq!(path.parent(), Some(target.as_path()));
        let bytes = tokio::fs::read(&path).await.expect("read back");
        assert_eq!(bytes, b"\x89PNG-bytes");
    }

    #[tokio::test]
    async fn failed_fetch_writes_no_file() {
        let base = serve_once("500 Internal Server Error", b"").await;
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store, &base, dir.path());

        let url = format!("{base}/prompt/x");
        let error = requestor.download(&url).await.expect_err("must fail");
        assert!(matches!(error, GalleryError::FetchImage { .. }));
        assert_eq!(requestor.image_loads().get(&url), ImageLoad::Failed);

        let mut entries = tokio::fs::read_dir(dir.path()).await.expect("read dir");
        assert!(entries.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn preview_download_needs_a_generated_image() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store, "https://image.pollinations.ai", dir.path());

        let error = requestor
            .download_preview(&signed_in("u1"))
            .await
            .expect_err("nothing yet");
        assert!(matches!(error, GalleryError::NothingToDownload { .. }));
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store.clone(), "https://image.pollinations.ai", dir.path());

        let GenerateOutcome::Saved { document_id, .. } =
            requestor.generate(&signed_in("u1"), "a cat").await
        else {
            panic!("expected saved outcome");
        };

        assert!(!requestor.delete(DocumentId::new_v7()).await.expect("silent"));
        assert!(requestor.delete(document_id).await.expect("delete"));
        assert!(image_documents(store.as_ref()).await.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_shows_the_placeholder_in_the_gallery() {
        let base = serve_once("404 Not Found", b"").await;
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store, &base, dir.path());
        let record = GeneratedImageRecord {
            id: DocumentId::new_v7(),
            owner_id: SessionId::new("u1"),
            url: format!("{base}/prompt/broken"),
            prompt: "broken".to_string(),
            created_at: Utc::now(),
        };

        let before = console::render_gallery(
            std::slice::from_ref(&record),
            &requestor.image_loads(),
        );
        assert!(before.contains(&record.url));

        requestor
            .download_record(&record)
            .await
            .expect_err("fetch fails");
        let after = console::render_gallery(
            std::slice::from_ref(&record),
            &requestor.image_loads(),
        );
        assert!(after.contains(PLACEHOLDER_IMAGE_URL));
        assert!(!after.contains(&record.url));
    }

    #[tokio::test]
    async fn preview_belongs_to_the_session_that_generated_it() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let requestor = requestor(store, "https://image.pollinations.ai", dir.path());
        let alice = signed_in("alice");
        let bob = signed_in("bob");

        let outcome = requestor.generate(&alice, "alice private prompt").await;
        assert!(matches!(outcome, GenerateOutcome::Saved { .. }));
        assert!(requestor.preview(&alice).is_some());
        assert_eq!(requestor.preview(&bob), None);
        assert_eq!(requestor.preview(&SessionContext::SignedOut), None);
        let error = requestor.download_preview(&bob).await.expect_err("not bob's");
        assert!(matches!(error, GalleryError::NothingToDownload { .. }));

        let mut loads = requestor.watch_image_loads();
        requestor.record_load("https://x/seen", ImageLoad::Failed);
        assert!(loads.has_changed().expect("sender alive"));
        loads.borrow_and_update();

        requestor.clear_session_state();
        assert_eq!(requestor.preview(&alice), None);
        assert_eq!(requestor.image_loads(), ImageLoads::default());
        assert!(loads.has_changed().expect("sender alive"));
    }
}
