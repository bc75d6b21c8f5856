use std::sync::atomic::{AtomicI64, Ordering};

use snafu::ensure;

use super::error::{InvalidDocumentSnafu, StorageResult};
use super::types::{DocumentFields, FieldValue, StoreTimestamp};

/// Commit clock that never hands out the same millisecond twice.
#[derive(Debug)]
pub(crate) struct CommitClock {
    last_millis: AtomicI64,
}

impl CommitClock {
    pub(crate) fn new(floor: StoreTimestamp) -> Self {
        Self {
            last_millis: AtomicI64::new(floor.as_millis()),
        }
    }

    pub(crate) fn next(&self) -> StoreTimestamp {
        let now = StoreTimestamp::now().as_millis();
        let previous = match self.last_millis.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |last| Some(now.max(last.saturating_add(1))),
        ) {
            Ok(previous) | Err(previous) => previous,
        };

        StoreTimestamp::from_millis(now.max(previous.saturating_add(1)))
    }
}

pub(crate) fn validate_write(collection: &str, fields: &DocumentFields) -> StorageResult<()> {
    ensure!(
        !collection.trim().is_empty(),
        InvalidDocumentSnafu {
            stage: "validate-write-collection",
            details: "collection name must not be blank".to_string(),
        }
    );
    ensure!(
        fields.keys().all(|name| !name.trim().is_empty()),
        InvalidDocumentSnafu {
            stage: "validate-write-fields",
            details: format!("document for '{collection}' has a blank field name"),
        }
    );

    Ok(())
}

/// Replaces every `ServerTimestamp` sentinel with the commit time.
pub(crate) fn resolve_server_timestamps(
    mut fields: DocumentFields,
    committed_at: StoreTimestamp,
) -> DocumentFields {
    for value in fields.values_mut() {
        if matches!(value, FieldValue::ServerTimestamp) {
            *value = FieldValue::Timestamp(committed_at);
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_monotonic() {
        let clock = CommitClock::new(StoreTimestamp::from_millis(0));
        let stamps = (0..1_000).map(|_| clock.next()).collect::<Vec<_>>();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn clock_respects_a_floor_in_the_future() {
        let floor = StoreTimestamp::from_millis(StoreTimestamp::now().as_millis() + 60_000);
        let clock = CommitClock::new(floor);
        assert!(clock.next() > floor);
    }

    #[test]
    fn sentinel_is_resolved_and_other_fields_untouched() {
        let mut fields = DocumentFields::new();
        fields.insert("timestamp".to_string(), FieldValue::ServerTimestamp);
        fields.insert("text".to_string(), FieldValue::from("hi"));

        let resolved = resolve_server_timestamps(fields, StoreTimestamp::from_millis(42));
        assert_eq!(
            resolved.get("timestamp"),
            Some(&FieldValue::Timestamp(StoreTimestamp::from_millis(42)))
        );
        assert_eq!(resolved.get("text"), Some(&FieldValue::from("hi")));
    }

    #[test]
    fn blank_collection_is_rejected() {
        assert!(validate_write("  ", &DocumentFields::new()).is_err());
    }
}
