use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

/// Storage type of a column. `Float` maps to SQLite REAL.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Blob,
}

impl ColumnType {
    pub(crate) fn sql_keyword(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// Conflict-resolution policy attached to a constraint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

impl ConflictPolicy {
    pub(crate) fn sql_keyword(self) -> &'static str {
        match self {
            ConflictPolicy::Rollback => "ROLLBACK",
            ConflictPolicy::Abort => "ABORT",
            ConflictPolicy::Fail => "FAIL",
            ConflictPolicy::Ignore => "IGNORE",
            ConflictPolicy::Replace => "REPLACE",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Unique,
}

impl ConstraintKind {
    pub(crate) fn sql_keyword(self) -> &'static str {
        match self {
            ConstraintKind::Unique => "UNIQUE",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub hidden: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub kind: ConstraintKind,
    pub conflict: ConflictPolicy,
    pub columns: Vec<String>,
}

/// Description of a table: columns in declaration order, constraints, and an
/// optional primary key. Column order is significant and stable; generated
/// statements always follow it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
    constraints: Vec<ConstraintDef>,
    primary_key: Option<String>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// A schema is usable once it declares at least one column.
    pub fn is_available(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn constraints(&self) -> &[ConstraintDef] {
        &self.constraints
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn add_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        nullable: bool,
    ) -> StoreResult<()> {
        self.push_column(name, column_type, nullable, false)
    }

    /// Declare a column whose stored value is obfuscated. Hidden columns must
    /// be text and can neither carry constraints nor act as the primary key.
    pub fn add_hidden_column(&mut self, name: &str, nullable: bool) -> StoreResult<()> {
        self.push_column(name, ColumnType::Text, nullable, true)
    }

    fn push_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        nullable: bool,
        hidden: bool,
    ) -> StoreResult<()> {
        if !crate::statement::is_valid_identifier(name) {
            return Err(StoreError::invalid(format!("illegal column name {name:?}")));
        }
        if hidden && column_type != ColumnType::Text {
            return Err(StoreError::invalid("hidden columns must be text"));
        }
        if self.column(name).is_some() {
            return Err(StoreError::conflict(format!("duplicate column {name:?}")));
        }
        self.columns.push(ColumnDef {
            name: name.to_string(),
            column_type,
            nullable,
            hidden,
        });
        Ok(())
    }

    pub fn add_constraint(
        &mut self,
        kind: ConstraintKind,
        conflict: ConflictPolicy,
        columns: &[&str],
    ) -> StoreResult<()> {
        if columns.is_empty() {
            return Err(StoreError::invalid("constraint needs at least one column"));
        }
        let mut names = Vec::with_capacity(columns.len());
        for name in columns {
            let column = self
                .column(name)
                .ok_or_else(|| StoreError::invalid(format!("unknown column {name:?}")))?;
            if column.hidden {
                return Err(StoreError::invalid(format!(
                    "hidden column {name:?} cannot be constrained"
                )));
            }
            if names.iter().any(|existing| existing == name) {
                return Err(StoreError::invalid(format!(
                    "column {name:?} repeated in constraint"
                )));
            }
            names.push((*name).to_string());
        }
        self.constraints.push(ConstraintDef {
            kind,
            conflict,
            columns: names,
        });
        Ok(())
    }

    /// An `Integer` primary key is rendered with AUTOINCREMENT.
    pub fn set_primary_key(&mut self, name: &str) -> StoreResult<()> {
        let column = self
            .column(name)
            .ok_or_else(|| StoreError::invalid(format!("unknown column {name:?}")))?;
        if column.hidden {
            return Err(StoreError::invalid(format!(
                "hidden column {name:?} cannot be the primary key"
            )));
        }
        self.primary_key = Some(name.to_string());
        Ok(())
    }

    pub fn clear_primary_key(&mut self) {
        self.primary_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_order_is_declaration_order() {
        let mut schema = TableSchema::new();
        schema.add_column("zeta", ColumnType::Integer, false).unwrap();
        schema.add_column("alpha", ColumnType::Text, true).unwrap();
        schema.add_column("mid", ColumnType::Float, true).unwrap();
        let names: Vec<_> = schema.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn rejects_quoting_characters() {
        let mut schema = TableSchema::new();
        assert!(schema.add_column("a`b", ColumnType::Text, true).is_err());
        assert!(schema.add_column("a\"b", ColumnType::Text, true).is_err());
        assert!(schema.add_column("", ColumnType::Text, true).is_err());
        assert!(schema.add_column("  ", ColumnType::Text, true).is_err());
    }

    #[test]
    fn rejects_duplicate_columns() {
        let mut schema = TableSchema::new();
        schema.add_column("name", ColumnType::Text, true).unwrap();
        assert!(schema.add_column("name", ColumnType::Integer, true).is_err());
    }

    #[test]
    fn hidden_column_cannot_be_primary_key_or_constrained() {
        let mut schema = TableSchema::new();
        schema.add_hidden_column("secret", false).unwrap();
        schema.add_column("id", ColumnType::Integer, false).unwrap();
        assert!(schema.set_primary_key("secret").is_err());
        assert!(schema
            .add_constraint(ConstraintKind::Unique, ConflictPolicy::Ignore, &["secret"])
            .is_err());
        assert!(schema.set_primary_key("id").is_ok());
    }

    #[test]
    fn constraint_requires_known_columns() {
        let mut schema = TableSchema::new();
        schema.add_column("a", ColumnType::Integer, false).unwrap();
        assert!(schema
            .add_constraint(ConstraintKind::Unique, ConflictPolicy::Replace, &["b"])
            .is_err());
        assert!(schema
            .add_constraint(ConstraintKind::Unique, ConflictPolicy::Replace, &[])
            .is_err());
        assert!(schema
            .add_constraint(ConstraintKind::Unique, ConflictPolicy::Replace, &["a", "a"])
            .is_err());
        assert!(schema
            .add_constraint(ConstraintKind::Unique, ConflictPolicy::Replace, &["a"])
            .is_ok());
    }

    #[test]
    fn availability_needs_a_column() {
        let mut schema = TableSchema::new();
        assert!(!schema.is_available());
        schema.add_column("a", ColumnType::Integer, false).unwrap();
        assert!(schema.is_available());
    }
}
