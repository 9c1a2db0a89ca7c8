use serde_json::Value as JsonValue;

use crate::statement::{is_valid_identifier, quote_ident};
use crate::{StoreError, StoreResult};

/// Comparison operator of a leaf condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compare {
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Equal,
    NotEqual,
    Like,
}

impl Compare {
    fn sql_keyword(self) -> &'static str {
        match self {
            Compare::Greater => ">",
            Compare::Less => "<",
            Compare::GreaterOrEqual => ">=",
            Compare::LessOrEqual => "<=",
            Compare::Equal => "=",
            Compare::NotEqual => "<>",
            Compare::Like => "LIKE",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    fn sql_keyword(self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }
}

/// Left-hand side of a leaf: a column reference or a bound literal.
#[derive(Clone, Debug)]
pub enum Operand {
    Column(String),
    Value(JsonValue),
}

/// A single comparison. Validated at construction, so compilation cannot
/// fail.
#[derive(Clone, Debug)]
pub struct Condition {
    left: Operand,
    compare: Compare,
    right: Option<JsonValue>,
    fuzzy: bool,
}

impl Condition {
    pub fn new(
        left: Operand,
        compare: Compare,
        right: Option<JsonValue>,
        fuzzy: bool,
    ) -> StoreResult<Self> {
        if let Operand::Column(name) = &left {
            if !is_valid_identifier(name) {
                return Err(StoreError::invalid(format!("illegal column name {name:?}")));
            }
        }
        if fuzzy && compare != Compare::Like {
            return Err(StoreError::invalid("fuzzy matching requires LIKE"));
        }
        match &right {
            Some(value) => {
                if compare == Compare::Like && value.is_number() {
                    return Err(StoreError::invalid("LIKE cannot compare to a number"));
                }
            }
            None => {
                if compare != Compare::Equal && compare != Compare::NotEqual {
                    return Err(StoreError::invalid(
                        "a null right operand requires = or <>",
                    ));
                }
            }
        }
        Ok(Self {
            left,
            compare,
            right,
            fuzzy,
        })
    }

    /// Compare a column against a literal value.
    pub fn column(name: &str, compare: Compare, value: impl Into<JsonValue>) -> StoreResult<Self> {
        Self::new(
            Operand::Column(name.to_string()),
            compare,
            Some(value.into()),
            false,
        )
    }

    /// `"name" IS NULL`.
    pub fn is_null(name: &str) -> StoreResult<Self> {
        Self::new(Operand::Column(name.to_string()), Compare::Equal, None, false)
    }

    /// `"name" IS NOT NULL`.
    pub fn is_not_null(name: &str) -> StoreResult<Self> {
        Self::new(
            Operand::Column(name.to_string()),
            Compare::NotEqual,
            None,
            false,
        )
    }

    /// `"name" LIKE ?`; with `fuzzy` the bound pattern is wrapped in `%`.
    pub fn like(name: &str, pattern: &str, fuzzy: bool) -> StoreResult<Self> {
        Self::new(
            Operand::Column(name.to_string()),
            Compare::Like,
            Some(JsonValue::String(pattern.to_string())),
            fuzzy,
        )
    }

    fn compile_into(&self, sql: &mut String, params: &mut Vec<JsonValue>) {
        match &self.left {
            Operand::Column(name) => sql.push_str(&quote_ident(name)),
            Operand::Value(value) => {
                sql.push('?');
                params.push(value.clone());
            }
        }
        match &self.right {
            None => {
                sql.push_str(" IS ");
                if self.compare == Compare::NotEqual {
                    sql.push_str("NOT ");
                }
                sql.push_str("NULL");
            }
            Some(value) => {
                sql.push(' ');
                sql.push_str(self.compare.sql_keyword());
                sql.push_str(" ?");
                if self.fuzzy {
                    let pattern = match value {
                        JsonValue::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    params.push(JsonValue::String(format!("%{pattern}%")));
                } else {
                    params.push(value.clone());
                }
            }
        }
    }
}

/// A condition tree: a leaf comparison or an AND/OR composite over at least
/// two children.
#[derive(Clone, Debug)]
pub enum ConditionExpr {
    Leaf(Condition),
    Composite {
        logic: Logic,
        children: Vec<ConditionExpr>,
    },
}

impl From<Condition> for ConditionExpr {
    fn from(condition: Condition) -> Self {
        ConditionExpr::Leaf(condition)
    }
}

impl ConditionExpr {
    pub fn and(children: Vec<ConditionExpr>) -> StoreResult<Self> {
        Self::composite(Logic::And, children)
    }

    pub fn or(children: Vec<ConditionExpr>) -> StoreResult<Self> {
        Self::composite(Logic::Or, children)
    }

    pub fn composite(logic: Logic, children: Vec<ConditionExpr>) -> StoreResult<Self> {
        if children.len() < 2 {
            return Err(StoreError::invalid(
                "a composite condition needs at least two children",
            ));
        }
        Ok(ConditionExpr::Composite { logic, children })
    }

    /// Compile to predicate text with `?` placeholders plus the parameters in
    /// binding order. Leaves are visited depth-first, left to right, so the
    /// output is identical across repeated calls.
    pub fn compile(&self) -> (String, Vec<JsonValue>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.compile_into(&mut sql, &mut params);
        (sql, params)
    }

    fn compile_into(&self, sql: &mut String, params: &mut Vec<JsonValue>) {
        match self {
            ConditionExpr::Leaf(condition) => condition.compile_into(sql, params),
            ConditionExpr::Composite { logic, children } => {
                sql.push('(');
                for (index, child) in children.iter().enumerate() {
                    if index > 0 {
                        sql.push(' ');
                        sql.push_str(logic.sql_keyword());
                        sql.push(' ');
                    }
                    child.compile_into(sql, params);
                }
                sql.push(')');
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn sql_keyword(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }

    pub(crate) fn sea_order(self) -> sea_orm::sea_query::Order {
        match self {
            SortDirection::Ascending => sea_orm::sea_query::Order::Asc,
            SortDirection::Descending => sea_orm::sea_query::Order::Desc,
        }
    }
}

/// One ORDER BY term: column, direction, optional case-insensitive collation.
#[derive(Clone, Debug)]
pub struct OrderSpec {
    column: String,
    direction: SortDirection,
    no_case: bool,
}

impl OrderSpec {
    pub fn new(column: &str, direction: SortDirection) -> StoreResult<Self> {
        if !is_valid_identifier(column) {
            return Err(StoreError::invalid(format!(
                "illegal column name {column:?}"
            )));
        }
        Ok(Self {
            column: column.to_string(),
            direction,
            no_case: false,
        })
    }

    pub fn no_case(mut self) -> Self {
        self.no_case = true;
        self
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    /// The order expression without the direction keyword, as handed to the
    /// statement builder.
    pub(crate) fn order_expr(&self) -> String {
        let mut expr = quote_ident(&self.column);
        if self.no_case {
            expr.push_str(" COLLATE NOCASE");
        }
        expr
    }

    /// The complete ORDER BY fragment, direction keyword included.
    pub fn to_fragment(&self) -> String {
        format!("{} {}", self.order_expr(), self.direction.sql_keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn leaf_compiles_column_against_value() {
        let condition = Condition::column("age", Compare::GreaterOrEqual, 18).unwrap();
        let (sql, params) = ConditionExpr::from(condition).compile();
        assert_eq!(sql, "\"age\" >= ?");
        assert_eq!(params, vec![json!(18)]);
    }

    #[test]
    fn null_right_operand_renders_is_null() {
        let (sql, params) = ConditionExpr::from(Condition::is_null("nick").unwrap()).compile();
        assert_eq!(sql, "\"nick\" IS NULL");
        assert!(params.is_empty());

        let (sql, _) = ConditionExpr::from(Condition::is_not_null("nick").unwrap()).compile();
        assert_eq!(sql, "\"nick\" IS NOT NULL");
    }

    #[test]
    fn fuzzy_like_wraps_pattern() {
        let condition = Condition::like("name", "magic", true).unwrap();
        let (sql, params) = ConditionExpr::from(condition).compile();
        assert_eq!(sql, "\"name\" LIKE ?");
        assert_eq!(params, vec![json!("%magic%")]);
    }

    #[test]
    fn literal_left_operand_is_bound() {
        let condition = Condition::new(
            Operand::Value(json!(1)),
            Compare::Equal,
            Some(json!(1)),
            false,
        )
        .unwrap();
        let (sql, params) = ConditionExpr::from(condition).compile();
        assert_eq!(sql, "? = ?");
        assert_eq!(params, vec![json!(1), json!(1)]);
    }

    #[test]
    fn composite_parenthesizes_and_orders_params_left_to_right() {
        let tree = ConditionExpr::or(vec![
            ConditionExpr::and(vec![
                Condition::column("a", Compare::Equal, 1).unwrap().into(),
                Condition::column("b", Compare::NotEqual, "x").unwrap().into(),
            ])
            .unwrap(),
            Condition::column("c", Compare::Less, 3.5).unwrap().into(),
        ])
        .unwrap();
        let (sql, params) = tree.compile();
        assert_eq!(sql, "((\"a\" = ? AND \"b\" <> ?) OR \"c\" < ?)");
        assert_eq!(params, vec![json!(1), json!("x"), json!(3.5)]);
    }

    #[test]
    fn compile_is_deterministic() {
        let tree = ConditionExpr::and(vec![
            Condition::column("a", Compare::Equal, 1).unwrap().into(),
            Condition::like("b", "needle", true).unwrap().into(),
            Condition::is_null("c").unwrap().into(),
        ])
        .unwrap();
        let first = tree.compile();
        for _ in 0..16 {
            assert_eq!(tree.compile(), first);
        }
    }

    #[test]
    fn rejects_invalid_leaves() {
        assert!(Condition::column("na`me", Compare::Equal, 1).is_err());
        assert!(Condition::column("name", Compare::Like, 7).is_err());
        assert!(Condition::new(
            Operand::Column("name".into()),
            Compare::Greater,
            None,
            false
        )
        .is_err());
        assert!(Condition::new(
            Operand::Column("name".into()),
            Compare::Equal,
            Some(json!("x")),
            true
        )
        .is_err());
    }

    #[test]
    fn composite_requires_two_children() {
        let leaf: ConditionExpr = Condition::is_null("a").unwrap().into();
        assert!(ConditionExpr::and(vec![leaf]).is_err());
    }

    #[test]
    fn order_spec_fragment() {
        let order = OrderSpec::new("name", SortDirection::Descending)
            .unwrap()
            .no_case();
        assert_eq!(order.to_fragment(), "\"name\" COLLATE NOCASE DESC");
        assert!(OrderSpec::new("na\"me", SortDirection::Ascending).is_err());
    }
}
