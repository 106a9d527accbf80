//! Forms and fields. Fields arrive over the wire as a tagged union over their
//! content kind; the runtime cares only about the capability set each variant
//! carries: render metadata, an open-form reference, a query reference.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::query::Query;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub id: Uuid,
    pub module_id: Uuid,
    pub preset_id_open: Option<Uuid>,
    pub icon_id: Option<Uuid>,
    pub name: String,
    pub no_data_actions: bool,
    pub query: Query,
    pub fields: Vec<Field>,
}

/// Reference from a field to the form it opens, kept valid under migrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenForm {
    pub form_id_open: Uuid,
    pub attribute_id_apply: Option<Uuid>,
    pub relation_index_apply: i32,
    pub pop_up_type: Option<String>,
}

/// Display column inside data-driven fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: Uuid,
    pub attribute_id: Uuid,
    pub index: i32,
    pub batch: Option<i32>,
    pub basis: i32,
    pub aggregator: Option<String>,
    pub distincted: bool,
    pub hidden: bool,
    pub on_mobile: bool,
    /// Nested query for sub-query columns.
    pub query: Option<Query>,
}

/// Properties shared by every field variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldBase {
    pub id: Uuid,
    pub icon_id: Option<Uuid>,
    pub state: String,
    pub on_mobile: bool,
}

/// A form field, polymorphic over its content kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "content", rename_all = "camelCase")]
pub enum Field {
    Button(FieldButton),
    Calendar(FieldCalendar),
    Chart(FieldChart),
    Container(FieldContainer),
    Data(FieldData),
    Header(FieldHeader),
    Kanban(FieldKanban),
    List(FieldList),
    Tabs(FieldTabs),
    Variable(FieldVariable),
}

impl Field {
    pub fn base(&self) -> &FieldBase {
        match self {
            Field::Button(f) => &f.base,
            Field::Calendar(f) => &f.base,
            Field::Chart(f) => &f.base,
            Field::Container(f) => &f.base,
            Field::Data(f) => &f.base,
            Field::Header(f) => &f.base,
            Field::Kanban(f) => &f.base,
            Field::List(f) => &f.base,
            Field::Tabs(f) => &f.base,
            Field::Variable(f) => &f.base,
        }
    }

    /// The query this field reads from, when it has one.
    pub fn query(&self) -> Option<&Query> {
        match self {
            Field::Calendar(f) => Some(&f.query),
            Field::Chart(f) => Some(&f.query),
            Field::Kanban(f) => Some(&f.query),
            Field::List(f) => Some(&f.query),
            _ => None,
        }
    }

    /// The open-form reference this field carries, when it has one.
    pub fn open_form(&self) -> Option<&OpenForm> {
        match self {
            Field::Button(f) => f.open_form.as_ref(),
            Field::Calendar(f) => f.open_form.as_ref(),
            Field::Kanban(f) => f.open_form.as_ref(),
            Field::List(f) => f.open_form.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldButton {
    #[serde(flatten)]
    pub base: FieldBase,
    pub js_function_id: Option<Uuid>,
    pub open_form: Option<OpenForm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCalendar {
    #[serde(flatten)]
    pub base: FieldBase,
    pub attribute_id_date0: Uuid,
    pub attribute_id_date1: Uuid,
    pub attribute_id_color: Option<Uuid>,
    pub ics: bool,
    pub gantt: bool,
    pub days: i32,
    pub query: Query,
    pub columns: Vec<Column>,
    pub open_form: Option<OpenForm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChart {
    #[serde(flatten)]
    pub base: FieldBase,
    pub chart_option: String,
    pub query: Query,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldContainer {
    #[serde(flatten)]
    pub base: FieldBase,
    pub direction: String,
    pub wrap: bool,
    pub grow: i32,
    pub shrink: i32,
    pub basis: i32,
    pub per_min: i32,
    pub per_max: i32,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldData {
    #[serde(flatten)]
    pub base: FieldBase,
    pub attribute_id: Uuid,
    pub attribute_id_alt: Option<Uuid>,
    pub index: i32,
    pub display: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub regex_check: Option<String>,
    pub js_function_id: Option<Uuid>,
    pub def: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldHeader {
    #[serde(flatten)]
    pub base: FieldBase,
    pub size: i32,
    pub richtext: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldKanban {
    #[serde(flatten)]
    pub base: FieldBase,
    pub relation_index_data: i32,
    pub relation_index_axis_x: i32,
    pub relation_index_axis_y: Option<i32>,
    pub attribute_id_sort: Option<Uuid>,
    pub query: Query,
    pub columns: Vec<Column>,
    pub open_form: Option<OpenForm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldList {
    #[serde(flatten)]
    pub base: FieldBase,
    pub auto_renew: Option<i32>,
    pub csv_export: bool,
    pub csv_import: bool,
    pub layout: String,
    pub filter_quick: bool,
    pub result_limit: i32,
    pub query: Query,
    pub columns: Vec<Column>,
    pub open_form: Option<OpenForm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTabs {
    #[serde(flatten)]
    pub base: FieldBase,
    pub tabs: Vec<Tab>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: Uuid,
    pub state: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldVariable {
    #[serde(flatten)]
    pub base: FieldBase,
    pub variable_id: Uuid,
    pub js_function_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> FieldBase {
        FieldBase {
            id: Uuid::new_v4(),
            icon_id: None,
            state: "default".into(),
            on_mobile: true,
        }
    }

    #[test]
    fn field_union_tags_by_content() {
        let field = Field::Header(FieldHeader {
            base: base(),
            size: 2,
            richtext: false,
        });
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["content"], "header");

        let back: Field = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Field::Header(_)));
    }

    #[test]
    fn container_nests_fields() {
        let inner = Field::Header(FieldHeader {
            base: base(),
            size: 1,
            richtext: false,
        });
        let outer = Field::Container(FieldContainer {
            base: base(),
            direction: "row".into(),
            wrap: false,
            grow: 1,
            shrink: 0,
            basis: 0,
            per_min: 0,
            per_max: 0,
            fields: vec![inner],
        });
        let json = serde_json::to_value(&outer).unwrap();
        let back: Field = serde_json::from_value(json).unwrap();
        let Field::Container(c) = back else {
            panic!("expected container");
        };
        assert_eq!(c.fields.len(), 1);
    }

    #[test]
    fn query_capability_only_on_data_driven_fields() {
        let header = Field::Header(FieldHeader {
            base: base(),
            size: 1,
            richtext: false,
        });
        assert!(header.query().is_none());
        assert!(header.open_form().is_none());
    }
}
