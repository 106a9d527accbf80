//! Data access layer: authorized create/update/delete/read on user-defined
//! relations, schema-aware query assembly, per-row policy filters, file
//! attribute lifecycle and change logs.

pub mod access;
pub mod datalog;
pub mod delete;
pub mod files;
pub mod get;
pub mod query;
pub mod set;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bp_domain::schema::{JoinConnector, QueryFilter};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `data.get`: one user query producing one SQL statement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGet {
    pub relation_id: Uuid,
    #[serde(default)]
    pub joins: Vec<DataJoin>,
    #[serde(default)]
    pub expressions: Vec<DataExpression>,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub orders: Vec<DataOrder>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// A joined relation. `index` numbers the relations inside the query
/// (0 = base); `index_from` names the relation the join hangs off. The apply
/// flags govern writes through this join, not reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataJoin {
    pub relation_id: Uuid,
    pub attribute_id: Uuid,
    pub index_from: i32,
    pub index: i32,
    pub connector: JoinConnector,
    #[serde(default)]
    pub apply_create: bool,
    #[serde(default)]
    pub apply_update: bool,
    #[serde(default)]
    pub apply_delete: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataExpression {
    pub attribute_id: Uuid,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub aggregator: Option<String>,
    #[serde(default)]
    pub distincted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOrder {
    pub attribute_id: Uuid,
    #[serde(default)]
    pub index: i32,
    pub ascending: bool,
}

/// One result row: the record id per relation index, then the expression
/// values in request order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRow {
    pub index_record_ids: HashMap<i32, Option<i64>>,
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGetResult {
    pub count: usize,
    pub rows: Vec<DataRow>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Write payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `data.set`: a batch of writes keyed by relation index. Index 0 is the
/// base record; joined writes reference their parent through `index_from`
/// plus the relationship attribute.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetCommand {
    pub relation_id: Uuid,
    /// Relation index of this command within the batch; 0 is the base.
    #[serde(default)]
    pub index: i32,
    /// Relationship attribute wiring this record to `index_from`'s record.
    #[serde(default)]
    pub attribute_id: Option<Uuid>,
    #[serde(default)]
    pub index_from: i32,
    /// 0 creates a record, anything else updates it.
    #[serde(default)]
    pub record_id: i64,
    #[serde(default)]
    pub attributes: Vec<DataSetAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetAttribute {
    pub attribute_id: Uuid,
    pub value: serde_json::Value,
}

/// Result of `data.set`: the record id per relation index (created ids
/// included).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetResult {
    pub index_record_ids: HashMap<i32, i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDelete {
    pub relation_id: Uuid,
    pub record_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_get_parses_minimal_payload() {
        let raw = format!(r#"{{"relationId":"{}"}}"#, Uuid::new_v4());
        let get: DataGet = serde_json::from_str(&raw).unwrap();
        assert!(get.joins.is_empty());
        assert!(get.expressions.is_empty());
        assert_eq!(get.limit, 0);
    }

    #[test]
    fn data_set_parses_wire_shape() {
        let relation = Uuid::new_v4();
        let attribute = Uuid::new_v4();
        let raw = format!(
            r#"[{{"relationId":"{relation}","recordId":0,
                 "attributes":[{{"attributeId":"{attribute}","value":"hello"}}]}}]"#
        );
        let commands: Vec<DataSetCommand> = serde_json::from_str(&raw).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].record_id, 0);
        assert_eq!(commands[0].attributes[0].attribute_id, attribute);
    }

    #[test]
    fn data_row_serialises_index_map_with_string_keys() {
        let mut index_record_ids = HashMap::new();
        index_record_ids.insert(0, Some(12i64));
        index_record_ids.insert(1, None);
        let row = DataRow {
            index_record_ids,
            values: vec![serde_json::json!("x")],
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["indexRecordIds"]["0"], 12);
        assert!(json["indexRecordIds"]["1"].is_null());
    }
}
