use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Database, DatabaseBackend, Statement};
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;

use apotheke::{
    ColumnType, Compare, Condition, ContentStore, EventPayload, JsonMap, NotifyOptions,
    NotifyTarget, QueryRequest, StoreEvent, StoreListener, StoreResult, TableSchema,
};

struct AcceptingListener;

#[async_trait]
impl StoreListener for AcceptingListener {
    async fn on_action_performing(
        &self,
        _event: StoreEvent,
        _target: Option<NotifyTarget>,
        _payload: Option<&EventPayload>,
    ) -> bool {
        true
    }
}

fn record(entries: &[(&str, JsonValue)]) -> JsonMap {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn hidden_column_is_transparent_to_callers_and_obfuscated_at_rest() -> StoreResult<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("content.sqlite");
    let store = ContentStore::open(&path, Arc::new(AcceptingListener), "topsecret").await?;

    let mut schema = TableSchema::new();
    schema.add_column("name", ColumnType::Text, false)?;
    schema.add_hidden_column("secret", false)?;
    store.create_table("credentials", &schema).await?;

    store
        .insert(
            "credentials",
            record(&[("name", json!("alice")), ("secret", json!("classified"))]),
            NotifyOptions::default(),
        )
        .await?;

    let rows = store.query("credentials", QueryRequest::default()).await?;
    assert_eq!(rows[0].get("secret"), Some(&json!("classified")));
    assert_eq!(rows[0].get("name"), Some(&json!("alice")));

    // The declaration is persisted in the reserved registry table.
    let registered = store
        .query(
            "apotheke_hidden",
            QueryRequest {
                condition: Some(
                    Condition::column("t_name", Compare::Equal, "credentials")?.into(),
                ),
                ..QueryRequest::default()
            },
        )
        .await?;
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].get("c_name"), Some(&json!("secret")));

    store.close().await?;

    // The raw engine must not see the plaintext.
    let conn = Database::connect(format!("sqlite://{}?mode=ro", path.display()))
        .await
        .expect("raw connect");
    let row = conn
        .query_one(Statement::from_string(
            DatabaseBackend::Sqlite,
            "SELECT \"secret\" FROM \"credentials\"".to_string(),
        ))
        .await
        .expect("raw query")
        .expect("one row");
    let raw: String = row.try_get("", "secret").expect("secret text");
    assert_ne!(raw, "classified");
    assert!(!raw.contains("classified"));
    conn.close().await.expect("raw close");

    // A reopened store reloads the vault from the registry and reveals again.
    let store = ContentStore::open(&path, Arc::new(AcceptingListener), "topsecret").await?;
    let rows = store.query("credentials", QueryRequest::default()).await?;
    assert_eq!(rows[0].get("secret"), Some(&json!("classified")));

    // Dropping the table clears its registry entries.
    store.drop_table("credentials").await?;
    let registered = store
        .query(
            "apotheke_hidden",
            QueryRequest {
                condition: Some(
                    Condition::column("t_name", Compare::Equal, "credentials")?.into(),
                ),
                ..QueryRequest::default()
            },
        )
        .await?;
    assert!(registered.is_empty());

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn hidden_column_declared_by_alter_is_registered() -> StoreResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = ContentStore::open(
        dir.path().join("content.sqlite"),
        Arc::new(AcceptingListener),
        "topsecret",
    )
    .await?;

    let mut schema = TableSchema::new();
    schema.add_column("name", ColumnType::Text, false)?;
    store.create_table("profiles", &schema).await?;

    let mut extension = TableSchema::new();
    extension.add_hidden_column("token", true)?;
    store.alter_table_add_column("profiles", &extension).await?;

    store
        .insert(
            "profiles",
            record(&[("name", json!("bob")), ("token", json!("opaque-token"))]),
            NotifyOptions::default(),
        )
        .await?;
    let rows = store.query("profiles", QueryRequest::default()).await?;
    assert_eq!(rows[0].get("token"), Some(&json!("opaque-token")));

    let registered = store
        .query(
            "apotheke_hidden",
            QueryRequest {
                condition: Some(Condition::column("t_name", Compare::Equal, "profiles")?.into()),
                ..QueryRequest::default()
            },
        )
        .await?;
    assert_eq!(registered.len(), 1);

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn settings_values_are_obfuscated_at_rest() -> StoreResult<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("content.sqlite");
    let store = ContentStore::open(&path, Arc::new(AcceptingListener), "topsecret").await?;
    store.put("api-key", Some("super-secret-value")).await?;
    assert_eq!(
        store.get("api-key").await?,
        Some("super-secret-value".to_string())
    );
    store.close().await?;

    let conn = Database::connect(format!("sqlite://{}?mode=ro", path.display()))
        .await
        .expect("raw connect");
    let row = conn
        .query_one(Statement::from_string(
            DatabaseBackend::Sqlite,
            "SELECT \"v\" FROM \"apotheke_settings\"".to_string(),
        ))
        .await
        .expect("raw query")
        .expect("one row");
    let raw: String = row.try_get("", "v").expect("value text");
    assert_ne!(raw, "super-secret-value");
    conn.close().await.expect("raw close");
    Ok(())
}
