use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of mutation a change event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Sent by a change source whenever a record in a collection is mutated.
/// `record` is the current snapshot of the record; for `Delete` it is the
/// last known snapshot. `old_record` is the pre-mutation snapshot and is
/// only present for `Update`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub change_type: ChangeType,
    pub record: Value,
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(collection: &str, record: Value) -> Self {
        Self {
            collection: collection.to_string(),
            change_type: ChangeType::Insert,
            record,
            old_record: None,
        }
    }

    pub fn update(collection: &str, record: Value, old_record: Value) -> Self {
        Self {
            collection: collection.to_string(),
            change_type: ChangeType::Update,
            record,
            old_record: Some(old_record),
        }
    }

    pub fn delete(collection: &str, record: Value) -> Self {
        Self {
            collection: collection.to_string(),
            change_type: ChangeType::Delete,
            record,
            old_record: None,
        }
    }

    /// The record's primary key. Events whose record has no string `id`
    /// are malformed and get dropped rather than buffered.
    pub fn record_id(&self) -> Option<&str> {
        self.record.get("id").and_then(|v| v.as_str())
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.record.get("owner_id").and_then(|v| v.as_str())
    }
}

/// The net effect of every event seen for one record within a single flush
/// window. The coalescer buffers at most one of these per record id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingChange {
    pub change_type: ChangeType,
    pub record: Value,
    pub old_record: Option<Value>,
}

impl PendingChange {
    pub fn record_id(&self) -> Option<&str> {
        self.record.get("id").and_then(|v| v.as_str())
    }
}

impl From<ChangeEvent> for PendingChange {
    fn from(event: ChangeEvent) -> Self {
        Self {
            change_type: event.change_type,
            record: event.record,
            old_record: event.old_record,
        }
    }
}
