use std::collections::HashMap;

use anuja_imagine::PLACEHOLDER_IMAGE_URL;
use anuja_storage::{DocumentFields, DocumentId, FieldValue, StoredDocument};
use chrono::{DateTime, Utc};

use crate::session::SessionId;
use crate::sync::{
    DecodeError, FromDocument, OWNER_FIELD, TIMESTAMP_FIELD, WrongTypeSnafu, read_text,
    read_timestamp,
};

pub const CHATS_COLLECTION: &str = "chats";
pub const IMAGES_COLLECTION: &str = "images";

pub const TEXT_FIELD: &str = "text";
pub const SENDER_FIELD: &str = "sender";
pub const URL_FIELD: &str = "url";
pub const PROMPT_FIELD: &str = "prompt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnSender {
    User,
    Assistant,
}

impl TurnSender {
    pub fn as_stored(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "ai",
        }
    }

    pub fn from_stored(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "ai" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One message in a conversation, either typed by the user or produced in reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub id: DocumentId,
    pub owner_id: SessionId,
    pub text: String,
    pub sender: TurnSender,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Write payload for a new turn. The commit timestamp is added by the writer.
    pub fn new_fields(owner: &SessionId, text: &str, sender: TurnSender) -> DocumentFields {
        let mut fields = DocumentFields::new();
        fields.insert(OWNER_FIELD.to_string(), FieldValue::from(owner.as_str()));
        fields.insert(TEXT_FIELD.to_string(), FieldValue::from(text));
        fields.insert(SENDER_FIELD.to_string(), FieldValue::from(sender.as_stored()));
        fields
    }
}

impl FromDocument for ConversationTurn {
    fn from_document(document: &StoredDocument) -> Result<Self, DecodeError> {
        let raw_sender = read_text(document, SENDER_FIELD)?;
        let sender = TurnSender::from_stored(&raw_sender).ok_or_else(|| {
            WrongTypeSnafu {
                document_id: document.id,
                field: SENDER_FIELD,
                expected: "\"user\" or \"ai\"",
            }
            .build()
        })?;

        Ok(Self {
            id: document.id,
            owner_id: SessionId::new(read_text(document, OWNER_FIELD)?),
            text: read_text(document, TEXT_FIELD)?,
            sender,
            created_at: read_timestamp(document, TIMESTAMP_FIELD)?,
        })
    }
}

/// Whether the browser-side fetch of an image URL worked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLoad {
    Pending,
    Loaded,
    Failed,
}

/// Load outcomes seen so far, keyed by image URL. Unseen URLs are pending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageLoads(HashMap<String, ImageLoad>);

impl ImageLoads {
    pub fn get(&self, url: &str) -> ImageLoad {
        self.0.get(url).copied().unwrap_or(ImageLoad::Pending)
    }

    /// Returns whether the stored outcome for `url` changed.
    pub fn record(&mut self, url: &str, load: ImageLoad) -> bool {
        self.0.insert(url.to_string(), load) != Some(load)
    }

    pub fn display_url<'a>(&self, url: &'a str) -> &'a str {
        display_url(url, self.get(url))
    }

    pub fn clear(&mut self) -> bool {
        let had_entries = !self.0.is_empty();
        self.0.clear();
        had_entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImageRecord {
    pub id: DocumentId,
    pub owner_id: SessionId,
    pub url: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl GeneratedImageRecord {
    pub fn new_fields(owner: &SessionId, url: &str, prompt: &str) -> DocumentFields {
        let mut fields = DocumentFields::new();
        fields.insert(OWNER_FIELD.to_string(), FieldValue::from(owner.as_str()));
        fields.insert(URL_FIELD.to_string(), FieldValue::from(url));
        fields.insert(PROMPT_FIELD.to_string(), FieldValue::from(prompt));
        fields
    }

    /// The URL to render; a failed load swaps in the static placeholder.
    pub fn display_url(&self, load: ImageLoad) -> &str {
        display_url(&self.url, load)
    }
}

impl FromDocument for GeneratedImageRecord {
    fn from_document(document: &StoredDocument) -> Result<Self, DecodeError> {
        Ok(Self {
            id: document.id,
            owner_id: SessionId::new(read_text(document, OWNER_FIELD)?),
            url: read_text(document, URL_FIELD)?,
            prompt: read_text(document, PROMPT_FIELD)?,
            created_at: read_timestamp(document, TIMESTAMP_FIELD)?,
        })
    }
}

pub fn display_url(url: &str, load: ImageLoad) -> &str {
    match load {
        ImageLoad::Failed => PLACEHOLDER_IMAGE_URL,
        ImageLoad::Pending | ImageLoad::Loaded => url,
    }
}

#[cfg(test)]
mod tests {
    use anuja_storage::StoreTimestamp;

    use super::*;

    fn stored(collection: &str, mut fields: DocumentFields, millis: i64) -> StoredDocument {
        fields.insert(
            TIMESTAMP_FIELD.to_string(),
            FieldValue::Timestamp(StoreTimestamp::from_millis(millis)),
        );
        StoredDocument {
            id: DocumentId::new_v7(),
            collection: collection.to_string(),
            fields,
        }
    }

    #[test]
    fn conversation_turn_maps_wire_fields() {
        let owner = SessionId::new("u1");
        let document = stored(
            CHATS_COLLECTION,
            ConversationTurn::new_fields(&owner, "hello", TurnSender::Assistant),
            1_700_000_000_000,
        );
        assert_eq!(document.get(SENDER_FIELD), Some(&FieldValue::from("ai")));

        let turn = ConversationTurn::from_document(&document).expect("decodes");
        assert_eq!(turn.owner_id, owner);
        assert_eq!(turn.text, "hello");
        assert_eq!(turn.sender, TurnSender::Assistant);
        assert_eq!(turn.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let mut fields = ConversationTurn::new_fields(&SessionId::new("u1"), "x", TurnSender::User);
        fields.insert(SENDER_FIELD.to_string(), FieldValue::from("bot"));
        let document = stored(CHATS_COLLECTION, fields, 1);

        let error = ConversationTurn::from_document(&document).expect_err("must fail");
        assert!(matches!(error, DecodeError::WrongType { field: SENDER_FIELD, .. }));
    }

    #[test]
    fn unresolved_timestamp_does_not_decode() {
        let mut fields =
            GeneratedImageRecord::new_fields(&SessionId::new("u1"), "https://x/y", "a cat");
        fields.insert(TIMESTAMP_FIELD.to_string(), FieldValue::ServerTimestamp);
        let document = StoredDocument {
            id: DocumentId::new_v7(),
            collection: IMAGES_COLLECTION.to_string(),
            fields,
        };

        assert!(GeneratedImageRecord::from_document(&document).is_err());
    }

    #[test]
    fn failed_image_load_shows_placeholder() {
        let document = stored(
            IMAGES_COLLECTION,
            GeneratedImageRecord::new_fields(&SessionId::new("u1"), "https://x/y", "a cat"),
            5,
        );
        let record = GeneratedImageRecord::from_document(&document).expect("decodes");

        assert_eq!(record.display_url(ImageLoad::Loaded), "https://x/y");
        assert_eq!(record.display_url(ImageLoad::Pending), "https://x/y");
        assert_eq!(record.display_url(ImageLoad::Failed), PLACEHOLDER_IMAGE_URL);
    }

    #[test]
    fn load_outcomes_are_tracked_per_url() {
        let mut loads = ImageLoads::default();
        assert_eq!(loads.get("https://x/a"), ImageLoad::Pending);

        assert!(loads.record("https://x/a", ImageLoad::Failed));
        assert!(!loads.record("https://x/a", ImageLoad::Failed));
        assert_eq!(loads.display_url("https://x/a"), PLACEHOLDER_IMAGE_URL);
        assert_eq!(loads.display_url("https://x/b"), "https://x/b");

        assert!(loads.record("https://x/a", ImageLoad::Loaded));
        assert_eq!(loads.display_url("https://x/a"), "https://x/a");
        assert!(loads.clear());
        assert!(!loads.clear());
    }
}
