//! Smaller module-owned entities: articles, icons, menus, login forms,
//! functions, collections, APIs, client events, search bars, variables and
//! widgets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::query::Query;

/// Help/documentation text attached to a module or form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    /// PNG bytes, base64 in the JSON snapshot.
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuTab {
    pub id: Uuid,
    pub module_id: Uuid,
    pub icon_id: Option<Uuid>,
    pub position: i32,
    pub menus: Vec<Menu>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Menu {
    pub id: Uuid,
    pub menu_tab_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub form_id: Option<Uuid>,
    pub icon_id: Option<Uuid>,
    pub position: i32,
    pub show_children: bool,
    pub menus: Vec<Menu>,
}

/// Form offered on the login page (password reset, registration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginForm {
    pub id: Uuid,
    pub module_id: Uuid,
    pub form_id: Uuid,
    pub attribute_id_login: Uuid,
    pub attribute_id_lookup: Uuid,
    pub name: String,
}

/// User-defined server-side procedure, addressed by id; may be referenced by
/// triggers, scheduled tasks, policies and client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PgFunction {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub code_args: String,
    pub code_function: String,
    pub code_returns: String,
    pub is_frontend_exec: bool,
    pub is_login_sync: bool,
    pub is_trigger: bool,
    pub cost: i32,
    pub schedules: Vec<PgFunctionSchedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PgFunctionSchedule {
    pub id: Uuid,
    pub pg_function_id: Uuid,
    pub at_second: i32,
    pub at_minute: i32,
    pub at_hour: i32,
    pub at_day: i32,
    /// One of: seconds, minutes, hours, days, weeks, months, years, once.
    pub interval_type: String,
    pub interval_value: i32,
}

/// User-defined client-side procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsFunction {
    pub id: Uuid,
    pub module_id: Uuid,
    pub form_id: Option<Uuid>,
    pub name: String,
    pub code_args: String,
    pub code_function: String,
    pub code_returns: String,
    pub is_client_event_exec: bool,
}

/// A named, query-backed value set pushed to clients and updated by
/// `update_collection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: Uuid,
    pub module_id: Uuid,
    pub icon_id: Option<Uuid>,
    pub name: String,
    pub query: Query,
    pub columns: Vec<super::form::Column>,
}

/// Versioned REST surface over a query. Addressed as `apiName.vN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Api {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub version: i32,
    pub has_delete: bool,
    pub has_get: bool,
    pub has_post: bool,
    pub limit_def: i32,
    pub limit_max: i32,
    pub verbose_def: bool,
    pub query: Query,
    pub columns: Vec<super::form::Column>,
}

impl Api {
    /// Wire name used in `ModuleApiNameMapId`: `name.vN`.
    pub fn versioned_name(&self) -> String {
        format!("{}.v{}", self.name, self.version)
    }
}

/// Client-side event hook (hotkey, js call) registered by a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    pub id: Uuid,
    pub module_id: Uuid,
    /// callJsFunction | callPgFunction.
    pub action: String,
    pub arguments: Vec<String>,
    /// onConnect | onDisconnect | onHotkey.
    pub event: String,
    pub hotkey_modifier1: Option<String>,
    pub hotkey_modifier2: Option<String>,
    pub hotkey_char: Option<String>,
    pub js_function_id: Option<Uuid>,
    pub pg_function_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBar {
    pub id: Uuid,
    pub module_id: Uuid,
    pub icon_id: Option<Uuid>,
    pub name: String,
    pub query: Query,
    pub columns: Vec<super::form::Column>,
}

/// Typed client-side state slot, form-scoped when `form_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: Uuid,
    pub module_id: Uuid,
    pub form_id: Option<Uuid>,
    pub name: String,
    pub content: String,
    pub content_use: String,
    pub def: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    pub id: Uuid,
    pub module_id: Uuid,
    pub form_id: Option<Uuid>,
    pub name: String,
    pub size: i32,
    pub collection: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_versioned_name() {
        let api = Api {
            id: Uuid::new_v4(),
            module_id: Uuid::new_v4(),
            name: "orders".into(),
            version: 3,
            has_delete: false,
            has_get: true,
            has_post: false,
            limit_def: 100,
            limit_max: 1000,
            verbose_def: false,
            query: Query {
                id: Uuid::new_v4(),
                relation_id: None,
                fixed_limit: 0,
                joins: vec![],
                filters: vec![],
                orders: vec![],
            },
            columns: vec![],
        };
        assert_eq!(api.versioned_name(), "orders.v3");
    }
}
