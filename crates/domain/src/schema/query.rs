//! Queries as stored in the schema: the relation, its joins, recursive
//! filters and orderings. Queries are referenced by forms, fields,
//! collections and APIs; a filter side may nest another query, forming a DAG
//! anchored at the top-level query. Cycles are rejected at insert time by the
//! Builder, so the runtime may recurse freely.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: Uuid,
    pub relation_id: Option<Uuid>,
    pub fixed_limit: i32,
    pub joins: Vec<QueryJoin>,
    pub filters: Vec<QueryFilter>,
    pub orders: Vec<QueryOrder>,
}

/// How a join is connected to the rows before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinConnector {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinConnector {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinConnector::Inner => "INNER JOIN",
            JoinConnector::Left => "LEFT JOIN",
            JoinConnector::Right => "RIGHT JOIN",
            JoinConnector::Full => "FULL JOIN",
        }
    }
}

/// One joined relation inside a query. `index` numbers relations within the
/// query (0 = base relation); `index_from` names the side the join hangs off.
/// The apply flags govern writes through this join, not reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJoin {
    pub relation_id: Uuid,
    pub attribute_id: Option<Uuid>,
    pub index_from: i32,
    pub index: i32,
    pub connector: JoinConnector,
    pub apply_create: bool,
    pub apply_update: bool,
    pub apply_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterConnector {
    And,
    Or,
}

impl FilterConnector {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterConnector::And => "AND",
            FilterConnector::Or => "OR",
        }
    }
}

/// One filter line. `index` pairs braces: `brackets0` opens before side 0,
/// `brackets1` closes after side 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    pub connector: FilterConnector,
    pub operator: String,
    pub side0: QueryFilterSide,
    pub side1: QueryFilterSide,
}

/// What a filter side refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterSideContent {
    Attribute,
    Value,
    SubQuery,
    LoginId,
    RecordId,
    Preset,
    True,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilterSide {
    pub content: FilterSideContent,
    pub attribute_id: Option<Uuid>,
    /// Relation index of the attribute within the query.
    pub attribute_index: i32,
    pub brackets: i32,
    pub preset_id: Option<Uuid>,
    pub value: Option<serde_json::Value>,
    /// Nested query for `SubQuery` sides; recursion is bounded because the
    /// query graph is a DAG.
    pub query: Option<Box<Query>>,
    /// Aggregator applied to a sub-query side (count, sum, …).
    pub query_aggregator: Option<String>,
}

impl QueryFilterSide {
    pub fn value_side(value: serde_json::Value) -> Self {
        Self {
            content: FilterSideContent::Value,
            attribute_id: None,
            attribute_index: 0,
            brackets: 0,
            preset_id: None,
            value: Some(value),
            query: None,
            query_aggregator: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOrder {
    pub attribute_id: Uuid,
    pub index: i32,
    pub ascending: bool,
}

/// The comparison operators the query assembler accepts. Anything else is
/// rejected before SQL is built.
pub const FILTER_OPERATORS: &[&str] = &[
    "=", "<>", "<", ">", "<=", ">=", "LIKE", "ILIKE", "NOT LIKE", "NOT ILIKE", "IS NULL",
    "IS NOT NULL", "= ANY", "<> ALL", "@>", "<@", "&&",
];

/// Whether the operator takes no right-hand side.
pub fn operator_is_unary(op: &str) -> bool {
    matches!(op, "IS NULL" | "IS NOT NULL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_cover_null_checks() {
        assert!(operator_is_unary("IS NULL"));
        assert!(operator_is_unary("IS NOT NULL"));
        assert!(!operator_is_unary("="));
        assert!(!operator_is_unary("= ANY"));
    }

    #[test]
    fn join_connector_sql() {
        assert_eq!(JoinConnector::Inner.as_sql(), "INNER JOIN");
        assert_eq!(JoinConnector::Left.as_sql(), "LEFT JOIN");
    }

    #[test]
    fn sub_query_sides_nest() {
        let inner = Query {
            id: Uuid::new_v4(),
            relation_id: Some(Uuid::new_v4()),
            fixed_limit: 0,
            joins: vec![],
            filters: vec![],
            orders: vec![],
        };
        let side = QueryFilterSide {
            content: FilterSideContent::SubQuery,
            attribute_id: None,
            attribute_index: 0,
            brackets: 0,
            preset_id: None,
            value: None,
            query: Some(Box::new(inner)),
            query_aggregator: Some("count".into()),
        };
        let json = serde_json::to_value(&side).unwrap();
        let back: QueryFilterSide = serde_json::from_value(json).unwrap();
        assert!(back.query.is_some());
        assert_eq!(back.content, FilterSideContent::SubQuery);
    }
}
