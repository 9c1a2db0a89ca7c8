//! Schema-driven, SQL-free access layer over an embedded SQLite store, with
//! change notification for a UI layer and an offline-first sync queue that a
//! periodic background task replays against a remote server.

pub mod condition;
pub mod event;
mod error;
mod hide;
pub mod observer;
pub mod schema;
mod statement;
pub mod store;
pub mod sync;

pub use condition::{
    Compare, Condition, ConditionExpr, Logic, Operand, OrderSpec, SortDirection,
};
pub use error::{StoreError, StoreResult};
pub use event::{
    ChangeRecord, EventPayload, JsonMap, NotifyOptions, NotifyTarget, PragmaHints, StoreEvent,
    StoreListener,
};
pub use observer::Observer;
pub use schema::{
    ColumnDef, ColumnType, ConflictPolicy, ConstraintDef, ConstraintKind, TableSchema,
};
pub use store::{ContentStore, QueryRequest, StoreOptions};
pub use sync::{RemoteSync, PERIODIC_SYNC_ID};
