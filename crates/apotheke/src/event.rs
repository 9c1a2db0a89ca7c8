use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Row content and notification payloads travel as JSON objects.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Lifecycle and mutation events surfaced to the [`StoreListener`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreEvent {
    InitialPragma,
    Initial,
    Available,
    InitialFail,
    Insert,
    Update,
    Delete,
    RemoteSync,
}

/// Which notification channel a mutation event is being routed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyTarget {
    Observer,
    Sync,
}

/// Engine tuning the store proposes during initialization; the listener
/// returns `true` to accept.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PragmaHints {
    pub auto_vacuum: bool,
}

/// One recorded mutation, as dispatched to observers and persisted in the
/// sync queue. The serialized form keeps the original wire field names
/// (`type`, `id`, `table_name`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeRecord {
    Insert {
        #[serde(rename = "id")]
        notify_id: i64,
        #[serde(rename = "table_name")]
        table: String,
        content: JsonMap,
    },
    Update {
        #[serde(rename = "id")]
        notify_id: i64,
        #[serde(rename = "table_name")]
        table: String,
        content: JsonMap,
        condition: String,
    },
    Delete {
        #[serde(rename = "id")]
        notify_id: i64,
        #[serde(rename = "table_name")]
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
}

impl ChangeRecord {
    pub fn event(&self) -> StoreEvent {
        match self {
            ChangeRecord::Insert { .. } => StoreEvent::Insert,
            ChangeRecord::Update { .. } => StoreEvent::Update,
            ChangeRecord::Delete { .. } => StoreEvent::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ChangeRecord::Insert { table, .. }
            | ChangeRecord::Update { table, .. }
            | ChangeRecord::Delete { table, .. } => table,
        }
    }

    pub fn notify_id(&self) -> i64 {
        match self {
            ChangeRecord::Insert { notify_id, .. }
            | ChangeRecord::Update { notify_id, .. }
            | ChangeRecord::Delete { notify_id, .. } => *notify_id,
        }
    }
}

/// Payload attached to a listener callback; which variant arrives is fixed by
/// the event kind.
#[derive(Clone, Debug)]
pub enum EventPayload {
    Pragma(PragmaHints),
    Failure { message: String },
    Change(ChangeRecord),
}

/// Routing switches for a mutation. `notify_id` defaults to the current epoch
/// milliseconds when unset.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotifyOptions {
    pub observer: bool,
    pub sync: bool,
    pub notify_id: Option<i64>,
}

impl NotifyOptions {
    pub fn observer() -> Self {
        Self {
            observer: true,
            ..Self::default()
        }
    }

    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            observer: true,
            sync: true,
            notify_id: None,
        }
    }

    pub fn with_notify_id(mut self, notify_id: i64) -> Self {
        self.notify_id = Some(notify_id);
        self
    }
}

/// The single registered collaborator informed of store lifecycle and
/// mutation events. A `false` return is treated as a callback failure and
/// logged; it never propagates to the caller of the mutating operation.
#[async_trait]
pub trait StoreListener: Send + Sync {
    async fn on_action_performing(
        &self,
        event: StoreEvent,
        target: Option<NotifyTarget>,
        payload: Option<&EventPayload>,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_record_wire_format_matches_legacy_fields() {
        let mut content = JsonMap::new();
        content.insert("name".into(), json!("magic"));
        let record = ChangeRecord::Insert {
            notify_id: 42,
            table: "users".into(),
            content,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "insert");
        assert_eq!(value["id"], 42);
        assert_eq!(value["table_name"], "users");
        assert_eq!(value["content"]["name"], "magic");
    }

    #[test]
    fn change_record_round_trips_through_text() {
        let record = ChangeRecord::Update {
            notify_id: 7,
            table: "users".into(),
            content: JsonMap::new(),
            condition: "\"id\" = ?".into(),
        };
        let text = serde_json::to_string(&record).unwrap();
        let decoded: ChangeRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded.event(), StoreEvent::Update);
        assert_eq!(decoded.table(), "users");
        assert_eq!(decoded.notify_id(), 7);
    }

    #[test]
    fn delete_without_condition_omits_the_field() {
        let record = ChangeRecord::Delete {
            notify_id: 1,
            table: "users".into(),
            condition: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("condition").is_none());
    }
}
