//! Relations and the entities they own: attributes, indexes, presets,
//! policies and triggers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-defined table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub comment: Option<String>,
    pub encryption: bool,
    /// Change-log retention: keep at most this many log entries per record.
    pub retention_count: Option<i32>,
    /// Change-log retention: keep log entries at most this many days.
    pub retention_days: Option<i32>,
    pub attributes: Vec<Attribute>,
    pub indexes: Vec<RelationIndex>,
    pub presets: Vec<Preset>,
    pub policies: Vec<Policy>,
    pub triggers: Vec<Trigger>,
}

impl Relation {
    /// Whether writes to this relation produce change-log rows.
    pub fn has_retention(&self) -> bool {
        self.retention_count.is_some() || self.retention_days.is_some()
    }

    pub fn attribute_by_name(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Storage content kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeContent {
    Integer,
    Bigint,
    Numeric,
    Real,
    Double,
    Varchar,
    Text,
    Boolean,
    Uuid,
    Files,
    #[serde(rename = "1:1")]
    Rel11,
    #[serde(rename = "n:1")]
    RelN1,
    #[serde(rename = "n:m")]
    RelNm,
}

impl AttributeContent {
    /// Relationship attributes reference another relation instead of holding
    /// a scalar value.
    pub fn is_relationship(&self) -> bool {
        matches!(
            self,
            AttributeContent::Rel11 | AttributeContent::RelN1 | AttributeContent::RelNm
        )
    }

    pub fn is_files(&self) -> bool {
        matches!(self, AttributeContent::Files)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AttributeContent::Integer
                | AttributeContent::Bigint
                | AttributeContent::Numeric
                | AttributeContent::Real
                | AttributeContent::Double
        )
    }
}

/// Presentation/semantics hint layered over the storage content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeContentUse {
    Default,
    Date,
    Datetime,
    Time,
    Richtext,
    Textarea,
    Color,
    Drawing,
    Iframe,
    Barcode,
    Login,
}

/// A typed column on a relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub id: Uuid,
    pub relation_id: Uuid,
    /// Target relation for relationship attributes.
    pub relationship_id: Option<Uuid>,
    pub icon_id: Option<Uuid>,
    pub name: String,
    pub content: AttributeContent,
    pub content_use: AttributeContentUse,
    pub length: i32,
    pub nullable: bool,
    pub encrypted: bool,
    /// SQL default expression, empty when none.
    pub def: String,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
}

/// An index over one or more attributes of a relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationIndex {
    pub id: Uuid,
    pub relation_id: Uuid,
    pub method: String,
    pub no_duplicates: bool,
    pub auto_fki: bool,
    pub primary_key: bool,
    pub attribute_ids: Vec<Uuid>,
}

/// A named, possibly protected, fixed row referenced by the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: Uuid,
    pub relation_id: Uuid,
    pub name: String,
    /// Protected presets refuse delete and value updates from the data layer.
    pub protected: bool,
    pub values: Vec<PresetValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetValue {
    pub id: Uuid,
    pub preset_id: Uuid,
    pub attribute_id: Uuid,
    pub preset_id_refer: Option<Uuid>,
    pub protected: bool,
    pub value: String,
}

/// A per-(relation, role, action) rule selecting an SQL predicate ANDed into
/// queries and writes. Policies are evaluated in `position` order; the first
/// matching role wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub relation_id: Uuid,
    pub position: i32,
    pub role_id: Uuid,
    /// Function returning the set of visible record ids, applied on reads.
    pub pg_function_id_select: Option<Uuid>,
    /// Function applied on updates.
    pub pg_function_id_update: Option<Uuid>,
    /// Function applied on deletes.
    pub pg_function_id_delete: Option<Uuid>,
    pub action_select: bool,
    pub action_update: bool,
    pub action_delete: bool,
}

/// Fires a PG function on relation writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: Uuid,
    pub module_id: Uuid,
    pub relation_id: Uuid,
    pub pg_function_id: Uuid,
    pub fires: String,
    pub on_insert: bool,
    pub on_update: bool,
    pub on_delete: bool,
    pub is_constraint: bool,
    pub is_deferrable: bool,
    pub is_deferred: bool,
    pub per_row: bool,
    pub code_condition: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_contents() {
        assert!(AttributeContent::RelN1.is_relationship());
        assert!(AttributeContent::Rel11.is_relationship());
        assert!(AttributeContent::RelNm.is_relationship());
        assert!(!AttributeContent::Text.is_relationship());
        assert!(!AttributeContent::Files.is_relationship());
    }

    #[test]
    fn relationship_serde_names() {
        let json = serde_json::to_string(&AttributeContent::RelN1).unwrap();
        assert_eq!(json, "\"n:1\"");
        let back: AttributeContent = serde_json::from_str("\"n:m\"").unwrap();
        assert_eq!(back, AttributeContent::RelNm);
    }

    #[test]
    fn retention_flags() {
        let mut rel = Relation {
            id: Uuid::new_v4(),
            module_id: Uuid::new_v4(),
            name: "orders".into(),
            comment: None,
            encryption: false,
            retention_count: None,
            retention_days: None,
            attributes: vec![],
            indexes: vec![],
            presets: vec![],
            policies: vec![],
            triggers: vec![],
        };
        assert!(!rel.has_retention());
        rel.retention_count = Some(10);
        assert!(rel.has_retention());
    }
}
