use sea_orm::sea_query::{QueryStatementWriter, SqliteQueryBuilder, Value as SeaValue};
use sea_orm::{ConnectionTrait, QueryResult, Statement};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::schema::{ColumnDef, ColumnType, TableSchema};
use crate::StoreResult;

/// Identifiers are interpolated into generated SQL, so they must not carry a
/// quoting character. Values never take this path; they are always bound.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains('`') && !name.contains('"')
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Map a JSON scalar onto a bindable value. Booleans bind as integers,
/// structured values as their JSON text.
pub(crate) fn json_to_value(value: &JsonValue) -> SeaValue {
    match value {
        JsonValue::Null => SeaValue::from(Option::<String>::None),
        JsonValue::Bool(flag) => SeaValue::from(*flag as i64),
        JsonValue::Number(number) => {
            if let Some(integer) = number.as_i64() {
                SeaValue::from(integer)
            } else if let Some(unsigned) = number.as_u64() {
                SeaValue::from(unsigned as i64)
            } else {
                SeaValue::from(number.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(text) => SeaValue::from(text.clone()),
        other => SeaValue::from(other.to_string()),
    }
}

pub(crate) fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let mut sql = format!("CREATE TABLE {} (", quote_ident(table));
    for (index, column) in schema.columns().iter().enumerate() {
        if index > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&quote_ident(&column.name));
        sql.push(' ');
        sql.push_str(column.column_type.sql_keyword());
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if schema.primary_key() == Some(column.name.as_str()) {
            sql.push_str(" PRIMARY KEY");
            if column.column_type == ColumnType::Integer {
                sql.push_str(" AUTOINCREMENT");
            }
        }
    }
    for (index, constraint) in schema.constraints().iter().enumerate() {
        sql.push_str(", CONSTRAINT ");
        sql.push_str(&quote_ident(&format!("cons_{index}")));
        sql.push(' ');
        sql.push_str(constraint.kind.sql_keyword());
        sql.push_str(" (");
        for (position, column) in constraint.columns.iter().enumerate() {
            if position > 0 {
                sql.push(',');
            }
            sql.push_str(&quote_ident(column));
        }
        sql.push_str(") ON CONFLICT ");
        sql.push_str(constraint.conflict.sql_keyword());
    }
    sql.push(')');
    sql
}

/// Altered-in columns are always nullable; SQLite cannot add a NOT NULL
/// column without a default.
pub(crate) fn add_column_sql(table: &str, column: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(table),
        quote_ident(&column.name),
        column.column_type.sql_keyword()
    )
}

fn build_stmt<S: QueryStatementWriter>(stmt: &S) -> (String, sea_orm::sea_query::Values) {
    stmt.build(SqliteQueryBuilder)
}

pub(crate) async fn exec<C, S>(conn: &C, stmt: &S, log_statements: bool) -> StoreResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(stmt);
    if log_statements {
        debug!(statement = %sql, "exec");
    }
    let result = conn
        .execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn exec_sql<C>(conn: &C, sql: &str, log_statements: bool) -> StoreResult<u64>
where
    C: ConnectionTrait,
{
    let backend = conn.get_database_backend();
    if log_statements {
        debug!(statement = %sql, "exec");
    }
    let result = conn
        .execute(Statement::from_string(backend, sql.to_string()))
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn query_all<C, S>(
    conn: &C,
    stmt: &S,
    log_statements: bool,
) -> StoreResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(stmt);
    if log_statements {
        debug!(statement = %sql, "query");
    }
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ConflictPolicy, ConstraintKind};

    #[test]
    fn renders_create_table_in_declaration_order() {
        let mut schema = TableSchema::new();
        schema.add_column("_id", ColumnType::Integer, false).unwrap();
        schema.add_column("name", ColumnType::Text, true).unwrap();
        schema.add_column("score", ColumnType::Float, true).unwrap();
        schema.set_primary_key("_id").unwrap();
        schema
            .add_constraint(ConstraintKind::Unique, ConflictPolicy::Replace, &["name"])
            .unwrap();
        assert_eq!(
            create_table_sql("users", &schema),
            "CREATE TABLE \"users\" (\
             \"_id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT, \
             \"name\" TEXT, \
             \"score\" REAL, \
             CONSTRAINT \"cons_0\" UNIQUE (\"name\") ON CONFLICT REPLACE)"
        );
    }

    #[test]
    fn non_integer_primary_key_has_no_autoincrement() {
        let mut schema = TableSchema::new();
        schema.add_column("key", ColumnType::Text, false).unwrap();
        schema.set_primary_key("key").unwrap();
        assert_eq!(
            create_table_sql("settings", &schema),
            "CREATE TABLE \"settings\" (\"key\" TEXT NOT NULL PRIMARY KEY)"
        );
    }

    #[test]
    fn renders_alter_add_column() {
        let column = ColumnDef {
            name: "nick".into(),
            column_type: ColumnType::Text,
            nullable: true,
            hidden: false,
        };
        assert_eq!(
            add_column_sql("users", &column),
            "ALTER TABLE \"users\" ADD COLUMN \"nick\" TEXT"
        );
    }

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("name"));
        assert!(is_valid_identifier("_id"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("   "));
        assert!(!is_valid_identifier("a`b"));
        assert!(!is_valid_identifier("a\"b"));
    }
}
