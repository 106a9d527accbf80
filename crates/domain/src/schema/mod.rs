//! Application schema entities.
//!
//! These types are the in-memory form of everything under the `app.*` tables:
//! modules and the entity tree they own. They are immutable from the
//! dispatcher's perspective; only Builder admin requests mutate them, after
//! which the schema cache reloads the affected modules wholesale.

mod form;
mod meta;
mod misc;
mod query;
mod relation;
mod role;

pub use form::*;
pub use meta::*;
pub use misc::*;
pub use query::*;
pub use relation::*;
pub use role::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A top-level container of user-defined schema. Modules may declare a single
/// parent module; parent links form a forest, never a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub form_id: Option<Uuid>,
    pub icon_id: Option<Uuid>,
    pub name: String,
    pub name_display: Option<String>,
    pub color1: Option<String>,
    pub position: i32,
    pub language_main: String,
    pub release_build: i32,
    pub release_build_app: i32,
    pub release_date: i64,
    pub languages: Vec<String>,
    pub dependencies: Vec<Uuid>,

    // Owned entity collections, ordered as persisted.
    pub articles: Vec<Article>,
    pub relations: Vec<Relation>,
    pub forms: Vec<Form>,
    pub menu_tabs: Vec<MenuTab>,
    pub icons: Vec<Icon>,
    pub roles: Vec<Role>,
    pub login_forms: Vec<LoginForm>,
    pub pg_functions: Vec<PgFunction>,
    pub js_functions: Vec<JsFunction>,
    pub collections: Vec<Collection>,
    pub apis: Vec<Api>,
    pub client_events: Vec<ClientEvent>,
    pub search_bars: Vec<SearchBar>,
    pub variables: Vec<Variable>,
    pub widgets: Vec<Widget>,
}

impl Module {
    pub fn relation_by_name(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}
