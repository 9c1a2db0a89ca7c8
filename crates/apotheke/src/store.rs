use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sea_orm::sea_query::{
    Alias, Asterisk, Expr, Func, Query, QueryStatementWriter, SelectStatement, SimpleExpr,
};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, FromQueryResult, QueryResult};
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use crate::condition::{Compare, Condition, ConditionExpr, OrderSpec, SortDirection};
use crate::event::{
    ChangeRecord, EventPayload, JsonMap, NotifyOptions, NotifyTarget, PragmaHints, StoreEvent,
    StoreListener,
};
use crate::hide::HiddenColumnVault;
use crate::observer::{Observer, ObserverRegistry};
use crate::schema::{ColumnType, ConflictPolicy, ConstraintKind, TableSchema};
use crate::statement::{
    add_column_sql, create_table_sql, exec, exec_sql, is_valid_identifier, json_to_value,
    query_all, quote_ident,
};
use crate::sync::{RemoteSync, SyncRegistry, PERIODIC_SYNC_ID};
use crate::{StoreError, StoreResult};

const HIDDEN_TABLE: &str = "apotheke_hidden";
const HIDDEN_COL_TABLE: &str = "t_name";
const HIDDEN_COL_COLUMN: &str = "c_name";
const SYNC_TABLE: &str = "apotheke_sync";
const SYNC_COL_ID: &str = "_id";
const SYNC_COL_TEXT: &str = "sync_text";
const SETTINGS_TABLE: &str = "apotheke_settings";
const SETTINGS_COL_KEY: &str = "k";
const SETTINGS_COL_VALUE: &str = "v";

const DEFAULT_SYNC_PERIOD_MS: u64 = 600;
const SYNC_TICK: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Minimum milliseconds between periodic sync cycles. Must be ≥ 1.
    pub sync_period_ms: u64,
    /// Route every compiled statement to `tracing::debug!`.
    pub log_statements: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_period_ms: DEFAULT_SYNC_PERIOD_MS,
            log_statements: false,
        }
    }
}

/// Projection, filtering and ordering of a [`ContentStore::query`]. A zero
/// `limit` means unlimited, a zero `offset` skips nothing.
#[derive(Clone, Debug, Default)]
pub struct QueryRequest {
    pub columns: Option<Vec<String>>,
    pub condition: Option<ConditionExpr>,
    pub offset: u64,
    pub limit: u64,
    pub reverse: bool,
    pub orders: Vec<OrderSpec>,
}

struct StoreInner {
    conn: DatabaseConnection,
    db_path: PathBuf,
    hide_key: String,
    listener: Arc<dyn StoreListener>,
    vault: HiddenColumnVault,
    observers: ObserverRegistry,
    syncs: SyncRegistry,
    available: AtomicBool,
    auto_commit: AtomicBool,
    sync_enabled: AtomicBool,
    sync_period_ms: AtomicU64,
    log_statements: bool,
    exec_lock: tokio::sync::Mutex<()>,
}

/// Handle to one open store. Cheap to clone; all clones share the connection,
/// the hidden-column vault and the observer/sync registries.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

impl ContentStore {
    /// Open or create the store at `path`. See
    /// [`open_with_options`](Self::open_with_options).
    pub async fn open(
        path: impl AsRef<Path>,
        listener: Arc<dyn StoreListener>,
        hide_key: &str,
    ) -> StoreResult<Self> {
        Self::open_with_options(path, listener, hide_key, StoreOptions::default()).await
    }

    /// Open or create the store at `path`. A fresh file gets the reserved
    /// tables and an `Initial` event; a pre-existing one has its hidden-column
    /// registry loaded. The listener sees `InitialPragma` before either path
    /// and `Available` after. On failure the store ends up unavailable and the
    /// on-disk artifacts are removed unless the listener's `InitialFail`
    /// handler returns `true`.
    pub async fn open_with_options(
        path: impl AsRef<Path>,
        listener: Arc<dyn StoreListener>,
        hide_key: &str,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if options.sync_period_ms < 1 {
            return Err(StoreError::invalid("sync period must be at least 1 ms"));
        }
        let is_new = !path.exists();
        let mut connect = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
        // One pooled connection: statements serialize and manual-commit mode
        // keeps its transaction on the same connection.
        connect.max_connections(1);
        // Disable sqlx's prepared-statement cache: a cached `SELECT *` keeps the
        // column metadata it was first described with, so reusing it after an
        // `ALTER TABLE ADD COLUMN` panics the sqlite driver on the stale count.
        connect.map_sqlx_sqlite_opts(|opts| opts.statement_cache_capacity(0));
        let conn = match Database::connect(connect).await {
            Ok(conn) => conn,
            Err(db_err) => {
                let err = StoreError::from(db_err);
                report_initial_failure(&path, listener.as_ref(), &err).await;
                return Err(err);
            }
        };
        let store = ContentStore {
            inner: Arc::new(StoreInner {
                conn,
                db_path: path.clone(),
                hide_key: hide_key.to_string(),
                listener,
                vault: HiddenColumnVault::new(),
                observers: ObserverRegistry::new(),
                syncs: SyncRegistry::new(),
                available: AtomicBool::new(true),
                auto_commit: AtomicBool::new(true),
                sync_enabled: AtomicBool::new(false),
                sync_period_ms: AtomicU64::new(options.sync_period_ms),
                log_statements: options.log_statements,
                exec_lock: tokio::sync::Mutex::new(()),
            }),
        };
        if let Err(err) = store.initialize(is_new).await {
            store.inner.available.store(false, Ordering::SeqCst);
            let _ = store.inner.conn.clone().close().await;
            report_initial_failure(&path, store.inner.listener.as_ref(), &err).await;
            return Err(err);
        }
        spawn_periodic(Arc::downgrade(&store.inner));
        Ok(store)
    }

    async fn initialize(&self, is_new: bool) -> StoreResult<()> {
        self.run_sql("PRAGMA encoding = 'UTF-8'").await?;
        let hints = PragmaHints { auto_vacuum: true };
        if self
            .call_listener(
                StoreEvent::InitialPragma,
                None,
                Some(&EventPayload::Pragma(hints)),
            )
            .await
        {
            self.run_sql("PRAGMA auto_vacuum = 1").await?;
        }
        if is_new {
            self.create_reserved_tables().await?;
            if !self.call_listener(StoreEvent::Initial, None, None).await {
                return Err(StoreError::storage("listener rejected the initial event"));
            }
        } else {
            self.load_vault().await?;
        }
        if !self.call_listener(StoreEvent::Available, None, None).await {
            return Err(StoreError::storage("listener rejected the available event"));
        }
        Ok(())
    }

    /// The hidden-column registry must exist before the sync queue and
    /// settings tables declare their hidden columns.
    async fn create_reserved_tables(&self) -> StoreResult<()> {
        let mut hidden = TableSchema::new();
        hidden.add_column(HIDDEN_COL_TABLE, ColumnType::Text, false)?;
        hidden.add_column(HIDDEN_COL_COLUMN, ColumnType::Text, false)?;
        hidden.add_constraint(
            ConstraintKind::Unique,
            ConflictPolicy::Ignore,
            &[HIDDEN_COL_TABLE, HIDDEN_COL_COLUMN],
        )?;
        self.create_table(HIDDEN_TABLE, &hidden).await?;

        let mut sync = TableSchema::new();
        sync.add_column(SYNC_COL_ID, ColumnType::Integer, false)?;
        sync.add_hidden_column(SYNC_COL_TEXT, false)?;
        sync.set_primary_key(SYNC_COL_ID)?;
        self.create_table(SYNC_TABLE, &sync).await?;

        let mut settings = TableSchema::new();
        settings.add_column(SETTINGS_COL_KEY, ColumnType::Text, false)?;
        settings.add_hidden_column(SETTINGS_COL_VALUE, false)?;
        settings.add_constraint(
            ConstraintKind::Unique,
            ConflictPolicy::Replace,
            &[SETTINGS_COL_KEY],
        )?;
        self.create_table(SETTINGS_TABLE, &settings).await
    }

    async fn load_vault(&self) -> StoreResult<()> {
        let rows = self
            .query(HIDDEN_TABLE, QueryRequest::default())
            .await
            .map_err(|err| StoreError::storage(format!("store file is damaged: {err}")))?;
        for row in rows {
            let table = row.get(HIDDEN_COL_TABLE).and_then(JsonValue::as_str);
            let column = row.get(HIDDEN_COL_COLUMN).and_then(JsonValue::as_str);
            if let (Some(table), Some(column)) = (table, column) {
                self.inner.vault.insert(table, column);
            }
        }
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn check_table_name(name: &str) -> StoreResult<()> {
        if is_valid_identifier(name) {
            Ok(())
        } else {
            Err(StoreError::invalid(format!("illegal table name {name:?}")))
        }
    }

    pub async fn create_table(&self, table: &str, schema: &TableSchema) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        if !schema.is_available() {
            return Err(StoreError::invalid("schema declares no columns"));
        }
        self.run_sql(&create_table_sql(table, schema)).await?;
        for column in schema.columns().iter().filter(|column| column.hidden) {
            self.register_hidden_column(table, &column.name).await?;
        }
        Ok(())
    }

    /// Add the schema's columns to an existing table, one ALTER per column.
    /// Added columns are always nullable and cannot join the primary key.
    pub async fn alter_table_add_column(
        &self,
        table: &str,
        schema: &TableSchema,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        if !schema.is_available() {
            return Err(StoreError::invalid("schema declares no columns"));
        }
        for column in schema.columns() {
            self.run_sql(&add_column_sql(table, column)).await?;
        }
        for column in schema.columns().iter().filter(|column| column.hidden) {
            self.register_hidden_column(table, &column.name).await?;
        }
        Ok(())
    }

    async fn register_hidden_column(&self, table: &str, column: &str) -> StoreResult<()> {
        let mut record = JsonMap::new();
        record.insert(HIDDEN_COL_TABLE.into(), JsonValue::String(table.into()));
        record.insert(HIDDEN_COL_COLUMN.into(), JsonValue::String(column.into()));
        self.insert(HIDDEN_TABLE, record, NotifyOptions::default())
            .await?;
        self.inner.vault.insert(table, column);
        Ok(())
    }

    pub async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        self.run_sql(&format!("DROP TABLE {}", quote_ident(table)))
            .await?;
        self.inner.vault.remove_table(table);
        let condition = Condition::column(HIDDEN_COL_TABLE, Compare::Equal, table)?;
        self.delete(HIDDEN_TABLE, &condition.into(), NotifyOptions::default())
            .await
    }

    pub async fn insert(
        &self,
        table: &str,
        content: JsonMap,
        notify: NotifyOptions,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        if content.is_empty() {
            return Err(StoreError::invalid("insert content is empty"));
        }
        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(table));
        let mut columns = Vec::with_capacity(content.len());
        let mut values: Vec<SimpleExpr> = Vec::with_capacity(content.len());
        for (name, value) in &content {
            if !is_valid_identifier(name) {
                return Err(StoreError::invalid(format!("illegal column name {name:?}")));
            }
            columns.push(Alias::new(name));
            values.push(self.bind_value(table, name, value).into());
        }
        stmt.columns(columns);
        stmt.values_panic(values);
        let affected = self.run_exec(&stmt).await?;
        if affected > 0 {
            let record = ChangeRecord::Insert {
                notify_id: notify.notify_id.unwrap_or_else(now_millis),
                table: table.to_string(),
                content,
            };
            self.route_notifications(record, notify).await;
        }
        Ok(())
    }

    /// Insert many rows in one statement, projecting each row onto `columns`.
    /// A row without one of the columns binds NULL there. Emits no
    /// notifications.
    pub async fn multi_insert(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[JsonMap],
    ) -> StoreResult<()> {
        self.multi_insert_slice(table, columns, rows, 0, rows.len())
            .await
    }

    /// [`multi_insert`](Self::multi_insert) restricted to `length` rows
    /// starting at `offset`; the range is clamped to the available rows.
    pub async fn multi_insert_slice(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[JsonMap],
        offset: usize,
        length: usize,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        if columns.is_empty() {
            return Err(StoreError::invalid("multi insert needs a column set"));
        }
        for name in columns {
            if !is_valid_identifier(name) {
                return Err(StoreError::invalid(format!("illegal column name {name:?}")));
            }
        }
        let start = offset.min(rows.len());
        let end = start.saturating_add(length).min(rows.len());
        if start == end {
            return Ok(());
        }
        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(table));
        stmt.columns(columns.iter().map(|name| Alias::new(*name)));
        for row in &rows[start..end] {
            let values: Vec<SimpleExpr> = columns
                .iter()
                .map(|name| {
                    let value = row.get(*name).cloned().unwrap_or(JsonValue::Null);
                    self.bind_value(table, name, &value).into()
                })
                .collect();
            stmt.values_panic(values);
        }
        self.run_exec(&stmt).await?;
        Ok(())
    }

    pub async fn update(
        &self,
        table: &str,
        content: JsonMap,
        condition: &ConditionExpr,
        notify: NotifyOptions,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        if content.is_empty() {
            return Err(StoreError::invalid("update content is empty"));
        }
        let (predicate, params) = condition.compile();
        let mut stmt = Query::update();
        stmt.table(Alias::new(table));
        for (name, value) in &content {
            if !is_valid_identifier(name) {
                return Err(StoreError::invalid(format!("illegal column name {name:?}")));
            }
            stmt.value(Alias::new(name), self.bind_value(table, name, value));
        }
        stmt.and_where(Expr::cust_with_values(
            predicate.clone(),
            params.iter().map(json_to_value),
        ));
        let affected = self.run_exec(&stmt).await?;
        if affected > 0 {
            let record = ChangeRecord::Update {
                notify_id: notify.notify_id.unwrap_or_else(now_millis),
                table: table.to_string(),
                content,
                condition: predicate,
            };
            self.route_notifications(record, notify).await;
        }
        Ok(())
    }

    pub async fn delete(
        &self,
        table: &str,
        condition: &ConditionExpr,
        notify: NotifyOptions,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        let (predicate, params) = condition.compile();
        let mut stmt = Query::delete();
        stmt.from_table(Alias::new(table));
        stmt.and_where(Expr::cust_with_values(
            predicate.clone(),
            params.iter().map(json_to_value),
        ));
        let affected = self.run_exec(&stmt).await?;
        if affected > 0 {
            let record = ChangeRecord::Delete {
                notify_id: notify.notify_id.unwrap_or_else(now_millis),
                table: table.to_string(),
                condition: Some(predicate),
            };
            self.route_notifications(record, notify).await;
        }
        Ok(())
    }

    /// Delete every row of the table; the table itself stays.
    pub async fn delete_all(&self, table: &str, notify: NotifyOptions) -> StoreResult<()> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        let mut stmt = Query::delete();
        stmt.from_table(Alias::new(table));
        let affected = self.run_exec(&stmt).await?;
        if affected > 0 {
            let record = ChangeRecord::Delete {
                notify_id: notify.notify_id.unwrap_or_else(now_millis),
                table: table.to_string(),
                condition: None,
            };
            self.route_notifications(record, notify).await;
        }
        Ok(())
    }

    pub async fn query(&self, table: &str, request: QueryRequest) -> StoreResult<Vec<JsonMap>> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        let mut stmt = Query::select();
        match &request.columns {
            Some(columns) if !columns.is_empty() => {
                for name in columns {
                    if !is_valid_identifier(name) {
                        return Err(StoreError::invalid(format!(
                            "illegal column name {name:?}"
                        )));
                    }
                    stmt.column(Alias::new(name));
                }
            }
            _ => {
                stmt.column(Asterisk);
            }
        }
        stmt.from(Alias::new(table));
        if let Some(condition) = &request.condition {
            let (predicate, params) = condition.compile();
            stmt.and_where(Expr::cust_with_values(
                predicate,
                params.iter().map(json_to_value),
            ));
        }
        for order in &request.orders {
            stmt.order_by_expr(Expr::cust(order.order_expr()), order.direction().sea_order());
        }
        if request.limit > 0 {
            stmt.limit(request.limit);
        } else if request.offset > 0 {
            // SQLite refuses OFFSET without LIMIT.
            stmt.limit(i64::MAX as u64);
        }
        if request.offset > 0 {
            stmt.offset(request.offset);
        }
        let rows = self.run_query(&stmt).await?;
        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            decoded.push(self.decode_row(table, &row)?);
        }
        if request.reverse {
            decoded.reverse();
        }
        Ok(decoded)
    }

    /// Number of matching rows, or −1 when the query could not execute (0 is
    /// a successful empty result).
    pub async fn count(&self, table: &str, condition: Option<&ConditionExpr>) -> i64 {
        match self.try_count(table, condition).await {
            Ok(count) => count,
            Err(err) => {
                error!("count: {err}");
                -1
            }
        }
    }

    async fn try_count(&self, table: &str, condition: Option<&ConditionExpr>) -> StoreResult<i64> {
        self.ensure_available()?;
        Self::check_table_name(table)?;
        let mut stmt = Query::select();
        stmt.expr_as(Func::count(Expr::col(Asterisk)), Alias::new("count"));
        stmt.from(Alias::new(table));
        if let Some(condition) = condition {
            let (predicate, params) = condition.compile();
            stmt.and_where(Expr::cust_with_values(
                predicate,
                params.iter().map(json_to_value),
            ));
        }
        let rows = self.run_query(&stmt).await?;
        let row = rows
            .first()
            .ok_or_else(|| StoreError::storage("count returned no row"))?;
        Ok(row.try_get::<i64>("", "count")?)
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        if key.trim().is_empty() {
            return Err(StoreError::invalid("settings key is empty"));
        }
        let condition = Condition::column(SETTINGS_COL_KEY, Compare::Equal, key)?;
        let rows = self
            .query(
                SETTINGS_TABLE,
                QueryRequest {
                    condition: Some(condition.into()),
                    ..QueryRequest::default()
                },
            )
            .await?;
        Ok(rows.into_iter().next().and_then(|row| {
            row.get(SETTINGS_COL_VALUE)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        }))
    }

    /// Upsert a settings value; `None` removes the key.
    pub async fn put(&self, key: &str, value: Option<&str>) -> StoreResult<()> {
        self.ensure_available()?;
        if key.trim().is_empty() {
            return Err(StoreError::invalid("settings key is empty"));
        }
        match value {
            None => {
                let condition = Condition::column(SETTINGS_COL_KEY, Compare::Equal, key)?;
                self.delete(
                    SETTINGS_TABLE,
                    &condition.into(),
                    NotifyOptions::default(),
                )
                .await
            }
            Some(value) => {
                let mut record = JsonMap::new();
                record.insert(SETTINGS_COL_KEY.into(), JsonValue::String(key.into()));
                record.insert(SETTINGS_COL_VALUE.into(), JsonValue::String(value.into()));
                self.insert(SETTINGS_TABLE, record, NotifyOptions::default())
                    .await
            }
        }
    }

    pub async fn remove(&self, key: &str) -> StoreResult<()> {
        self.put(key, None).await
    }

    pub async fn vacuum(&self) -> StoreResult<()> {
        self.ensure_available()?;
        self.run_sql("VACUUM").await?;
        Ok(())
    }

    pub fn is_auto_commit(&self) -> bool {
        self.inner.auto_commit.load(Ordering::SeqCst)
    }

    /// Toggle auto-commit. Leaving auto-commit opens a transaction that
    /// subsequent [`commit`](Self::commit)/[`rollback`](Self::rollback) calls
    /// close and reopen; returning to auto-commit commits the open one.
    pub async fn set_auto_commit(&self, auto_commit: bool) -> StoreResult<()> {
        self.ensure_available()?;
        if self.is_auto_commit() == auto_commit {
            return Ok(());
        }
        if auto_commit {
            self.run_sql("COMMIT").await?;
        } else {
            self.run_sql("BEGIN").await?;
        }
        self.inner.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    pub async fn commit(&self) -> StoreResult<()> {
        self.ensure_available()?;
        if self.is_auto_commit() {
            return Err(StoreError::invalid("auto-commit is active"));
        }
        self.run_sql("COMMIT").await?;
        self.run_sql("BEGIN").await?;
        Ok(())
    }

    pub async fn rollback(&self) -> StoreResult<()> {
        self.ensure_available()?;
        if self.is_auto_commit() {
            return Err(StoreError::invalid("auto-commit is active"));
        }
        self.run_sql("ROLLBACK").await?;
        self.run_sql("BEGIN").await?;
        Ok(())
    }

    /// Mark the store unavailable, wait for the in-flight statement and close
    /// the connection. The periodic task observes the flag and exits.
    pub async fn close(&self) -> StoreResult<()> {
        self.ensure_available()?;
        self.inner.available.store(false, Ordering::SeqCst);
        let _guard = self.inner.exec_lock.lock().await;
        self.inner.conn.clone().close().await?;
        Ok(())
    }

    pub fn register_observer(
        &self,
        id: &str,
        observer: Arc<dyn Observer>,
        overlap: bool,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        self.inner.observers.register(id, observer, overlap)
    }

    /// Ask the named observer to refresh its presentation of the data.
    pub async fn notify_observer(&self, id: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let observer = self
            .inner
            .observers
            .get(id)
            .ok_or_else(|| StoreError::not_found(format!("no observer {id:?}")))?;
        Ok(observer.refresh_view().await)
    }

    pub fn register_sync(
        &self,
        id: &str,
        handler: Arc<dyn RemoteSync>,
        overlap: bool,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        self.inner.syncs.register(id, handler, overlap)
    }

    /// Push a change to the named handler immediately, outside the periodic
    /// cycle.
    pub async fn notify_sync_to_server(
        &self,
        id: &str,
        change: &ChangeRecord,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let handler = self
            .inner
            .syncs
            .get(id)
            .ok_or_else(|| StoreError::not_found(format!("no sync handler {id:?}")))?;
        Ok(handler.sync_to_server(change).await)
    }

    pub fn is_periodic_sync_running(&self) -> bool {
        self.inner.sync_enabled.load(Ordering::SeqCst)
    }

    pub fn start_periodic_sync(&self) -> StoreResult<()> {
        if self
            .inner
            .sync_enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::conflict("periodic sync is already running"));
        }
        Ok(())
    }

    pub fn stop_periodic_sync(&self) -> StoreResult<()> {
        if self
            .inner
            .sync_enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::conflict("periodic sync is not running"));
        }
        Ok(())
    }

    pub fn sync_period(&self) -> u64 {
        self.inner.sync_period_ms.load(Ordering::SeqCst)
    }

    pub fn set_sync_period(&self, period_ms: u64) -> StoreResult<()> {
        self.ensure_available()?;
        if period_ms < 1 {
            return Err(StoreError::invalid("sync period must be at least 1 ms"));
        }
        self.inner.sync_period_ms.store(period_ms, Ordering::SeqCst);
        Ok(())
    }

    /// Run one replay cycle immediately: drain the queue through the handler
    /// registered under [`PERIODIC_SYNC_ID`], then fire the pull-from-server
    /// callback. The periodic task runs exactly this on its schedule.
    pub async fn run_sync_cycle(&self) -> StoreResult<()> {
        self.ensure_available()?;
        if let Err(err) = self.drain_sync_queue().await {
            error!("sync: {err}");
        }
        if !self
            .call_listener(StoreEvent::RemoteSync, Some(NotifyTarget::Sync), None)
            .await
        {
            warn!("sync: pull-from-server callback reported failure");
        }
        Ok(())
    }

    /// Replay queued changes oldest-first. The first failure stops the batch:
    /// the failed entry and everything after it stay queued for the next
    /// cycle, so delivery is at-least-once and strictly ordered.
    async fn drain_sync_queue(&self) -> StoreResult<()> {
        let order = OrderSpec::new(SYNC_COL_ID, SortDirection::Ascending)?;
        let rows = self
            .query(
                SYNC_TABLE,
                QueryRequest {
                    orders: vec![order],
                    ..QueryRequest::default()
                },
            )
            .await?;
        for row in rows {
            let id = row
                .get(SYNC_COL_ID)
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| StoreError::storage("sync entry without id"))?;
            let text = row
                .get(SYNC_COL_TEXT)
                .and_then(JsonValue::as_str)
                .ok_or_else(|| StoreError::storage("sync entry without payload"))?;
            let record: ChangeRecord = serde_json::from_str(text)
                .map_err(|err| StoreError::storage(format!("undecodable sync entry {id}: {err}")))?;
            let handler = self
                .inner
                .syncs
                .get(PERIODIC_SYNC_ID)
                .ok_or_else(|| StoreError::not_found("no periodic sync handler registered"))?;
            if !handler.sync_to_server(&record).await {
                debug!("sync entry {id} not acknowledged, keeping the queue");
                break;
            }
            let condition = Condition::column(SYNC_COL_ID, Compare::Equal, id)?;
            self.delete(SYNC_TABLE, &condition.into(), NotifyOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn call_listener(
        &self,
        event: StoreEvent,
        target: Option<NotifyTarget>,
        payload: Option<&EventPayload>,
    ) -> bool {
        self.inner
            .listener
            .on_action_performing(event, target, payload)
            .await
    }

    async fn route_notifications(&self, record: ChangeRecord, notify: NotifyOptions) {
        if notify.observer {
            let payload = EventPayload::Change(record.clone());
            if !self
                .call_listener(record.event(), Some(NotifyTarget::Observer), Some(&payload))
                .await
            {
                warn!(
                    table = record.table(),
                    "observer notification was rejected by the listener"
                );
            }
        }
        if notify.sync {
            if let Err(err) = self.enqueue_sync(&record).await {
                error!(table = record.table(), "cannot queue change for sync: {err}");
            }
        }
    }

    /// Append a change to the sync queue. Built inline rather than through
    /// [`insert`](Self::insert) so the mutation path stays non-recursive.
    async fn enqueue_sync(&self, record: &ChangeRecord) -> StoreResult<()> {
        let text = serde_json::to_string(record)
            .map_err(|err| StoreError::storage(err.to_string()))?;
        let payload = JsonValue::String(text);
        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(SYNC_TABLE));
        stmt.columns([Alias::new(SYNC_COL_TEXT)]);
        stmt.values_panic([self
            .bind_value(SYNC_TABLE, SYNC_COL_TEXT, &payload)
            .into()]);
        self.run_exec(&stmt).await?;
        Ok(())
    }

    /// Values bound for a hidden column pass through the write transform;
    /// everything else binds as-is. Only string values are transformed.
    fn bind_value(
        &self,
        table: &str,
        column: &str,
        value: &JsonValue,
    ) -> sea_orm::sea_query::Value {
        if let JsonValue::String(text) = value {
            if self.inner.vault.contains(table, column) {
                return sea_orm::sea_query::Value::from(apotheke_hider::conceal(
                    text,
                    &self.inner.hide_key,
                ));
            }
        }
        json_to_value(value)
    }

    fn decode_row(&self, table: &str, row: &QueryResult) -> StoreResult<JsonMap> {
        let value = JsonValue::from_query_result(row, "")?;
        let JsonValue::Object(mut map) = value else {
            return Err(StoreError::storage("unexpected row shape"));
        };
        for (name, field) in map.iter_mut() {
            if self.inner.vault.contains(table, name) {
                if let JsonValue::String(text) = field {
                    *field =
                        JsonValue::String(apotheke_hider::reveal(text, &self.inner.hide_key)?);
                }
            }
        }
        Ok(map)
    }

    async fn run_exec(&self, stmt: &impl QueryStatementWriter) -> StoreResult<u64> {
        let _guard = self.inner.exec_lock.lock().await;
        exec(&self.inner.conn, stmt, self.inner.log_statements).await
    }

    async fn run_query(&self, stmt: &SelectStatement) -> StoreResult<Vec<QueryResult>> {
        let _guard = self.inner.exec_lock.lock().await;
        query_all(&self.inner.conn, stmt, self.inner.log_statements).await
    }

    async fn run_sql(&self, sql: &str) -> StoreResult<u64> {
        let _guard = self.inner.exec_lock.lock().await;
        exec_sql(&self.inner.conn, sql, self.inner.log_statements).await
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

async fn report_initial_failure(path: &Path, listener: &dyn StoreListener, err: &StoreError) {
    error!("initialize: {err}");
    let payload = EventPayload::Failure {
        message: err.to_string(),
    };
    let preserve = listener
        .on_action_performing(StoreEvent::InitialFail, None, Some(&payload))
        .await;
    if !preserve {
        remove_store_files(path);
    }
}

fn remove_store_files(path: &Path) {
    for suffix in ["", "-journal", "-wal", "-shm"] {
        let mut artifact = path.as_os_str().to_os_string();
        artifact.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(&artifact));
    }
}

/// One long-lived task per store. It holds only a weak handle so an
/// abandoned store can still be dropped; the loop exits when the store
/// closes or goes away.
fn spawn_periodic(inner: Weak<StoreInner>) {
    tokio::spawn(async move {
        let mut last_cycle = Instant::now();
        loop {
            tokio::time::sleep(SYNC_TICK).await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !inner.available.load(Ordering::SeqCst) {
                break;
            }
            let store = ContentStore { inner };
            if store.inner.sync_enabled.load(Ordering::SeqCst) {
                let period = Duration::from_millis(store.inner.sync_period_ms.load(Ordering::SeqCst));
                if last_cycle.elapsed() >= period {
                    last_cycle = Instant::now();
                    debug!("periodic sync cycle");
                    let _ = store.run_sync_cycle().await;
                }
            }
        }
    });
}
