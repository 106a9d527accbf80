//! Schema loader.
//!
//! Loads modules from the `app.*` tables into detached [`Module`] values and
//! publishes them into the cache only once fully populated. Any SQL failure
//! aborts the load and leaves the cache untouched; partial state never leaks
//! to readers.

use std::collections::HashMap;

use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result, SchemaEntity};
use bp_domain::schema::{
    Api, Article, Attribute, AttributeContent, AttributeContentUse, ClientEvent, Collection,
    Column, Field, Form, Icon, JsFunction, LoginForm, Menu, MenuTab, Module, ModuleMeta,
    PgFunction, PgFunctionSchedule, Policy, Preset, PresetValue, Query, Relation, RelationIndex,
    Role, RoleContent, SearchBar, Trigger, Variable, Widget,
};
use bp_store::Db;

use crate::cache::SchemaCache;

/// Refresh the module meta map from storage and drop modules that
/// disappeared. Returns the removed module ids.
pub async fn reload_meta(db: &Db, cache: &SchemaCache) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT module_id, hash, release_build, release_build_app, release_date,
                languages_custom, date_change, owner, hidden, position_nav
         FROM instance.module_meta",
    )
    .fetch_all(db.pool())
    .await
    .map_err(classify_db_error)?;

    let mut meta = HashMap::with_capacity(rows.len());
    for row in rows {
        let module_id: Uuid = row.try_get("module_id").map_err(classify_db_error)?;
        meta.insert(
            module_id,
            ModuleMeta {
                module_id,
                hash: get_trimmed(&row, "hash")?,
                release_build: row.try_get("release_build").map_err(classify_db_error)?,
                release_build_app: row
                    .try_get("release_build_app")
                    .map_err(classify_db_error)?,
                release_date: row.try_get("release_date").map_err(classify_db_error)?,
                languages_custom: get_char_array(&row, "languages_custom")?,
                date_change: row.try_get("date_change").map_err(classify_db_error)?,
                owner: row.try_get("owner").map_err(classify_db_error)?,
                hidden: row.try_get("hidden").map_err(classify_db_error)?,
                position: row.try_get("position_nav").map_err(classify_db_error)?,
            },
        );
    }

    let removed = cache.replace_meta(meta);
    if !removed.is_empty() {
        tracing::info!(removed = removed.len(), "modules dropped from meta");
    }
    Ok(removed)
}

/// Load every module referenced in the meta map.
pub async fn load_all(db: &Db, cache: &SchemaCache) -> Result<i64> {
    reload_meta(db, cache).await?;
    let ids = cache.meta_module_ids();
    update(db, cache, &ids, true).await
}

/// Reload the given modules. Each module is fetched inside one transaction
/// and published atomically; the JSON snapshots are regenerated after the
/// whole set is in place. Returns the new schema timestamp.
pub async fn update(db: &Db, cache: &SchemaCache, module_ids: &[Uuid], initial: bool) -> Result<i64> {
    for id in module_ids {
        let mut tx = db.begin().await?;
        let module = load_module(&mut tx, id).await?;
        // Read-only transaction; dropping it releases the snapshot.
        drop(tx);
        cache.publish_module(module);
    }

    let timestamp = cache.regenerate_json(module_ids)?;

    tracing::info!(
        modules = module_ids.len(),
        initial,
        timestamp,
        "schema cache updated"
    );
    debug_assert!(cache.check_invariants().is_ok());
    Ok(timestamp)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-module load
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn load_module(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    id: &Uuid,
) -> Result<Module> {
    let conn: &mut PgConnection = &mut *tx;
    load_module_on(conn, id).await
}

async fn load_module_on(conn: &mut PgConnection, id: &Uuid) -> Result<Module> {
    let row = sqlx::query(
        "SELECT id, parent_id, form_id, icon_id, name, name_display, color1,
                position_nav, language_main, release_build, release_build_app,
                release_date, languages
         FROM app.module WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(classify_db_error)?
    .ok_or(Error::SchemaUnknown(SchemaEntity::Module, *id))?;

    let mut module = Module {
        id: *id,
        parent_id: row.try_get("parent_id").map_err(classify_db_error)?,
        form_id: row.try_get("form_id").map_err(classify_db_error)?,
        icon_id: row.try_get("icon_id").map_err(classify_db_error)?,
        name: row.try_get("name").map_err(classify_db_error)?,
        name_display: row.try_get("name_display").map_err(classify_db_error)?,
        color1: row.try_get("color1").map_err(classify_db_error)?,
        position: row.try_get("position_nav").map_err(classify_db_error)?,
        language_main: get_trimmed(&row, "language_main")?,
        release_build: row.try_get("release_build").map_err(classify_db_error)?,
        release_build_app: row
            .try_get("release_build_app")
            .map_err(classify_db_error)?,
        release_date: row.try_get("release_date").map_err(classify_db_error)?,
        languages: get_char_array(&row, "languages")?,
        dependencies: Vec::new(),
        articles: Vec::new(),
        relations: Vec::new(),
        forms: Vec::new(),
        menu_tabs: Vec::new(),
        icons: Vec::new(),
        roles: Vec::new(),
        login_forms: Vec::new(),
        pg_functions: Vec::new(),
        js_functions: Vec::new(),
        collections: Vec::new(),
        apis: Vec::new(),
        client_events: Vec::new(),
        search_bars: Vec::new(),
        variables: Vec::new(),
        widgets: Vec::new(),
    };

    module.dependencies =
        sqlx::query_scalar("SELECT module_id_on FROM app.module_depends WHERE module_id = $1")
            .bind(id)
            .fetch_all(&mut *conn)
            .await
            .map_err(classify_db_error)?;

    module.articles = load_articles(conn, id).await?;
    module.relations = load_relations(conn, id).await?;
    module.forms = load_forms(conn, id).await?;
    module.menu_tabs = load_menu_tabs(conn, id).await?;
    module.icons = load_icons(conn, id).await?;
    module.roles = load_roles(conn, id).await?;
    module.login_forms = load_login_forms(conn, id).await?;
    module.pg_functions = load_pg_functions(conn, id).await?;
    module.js_functions = load_js_functions(conn, id).await?;
    module.collections = load_collections(conn, id).await?;
    module.apis = load_apis(conn, id).await?;
    module.client_events = load_client_events(conn, id).await?;
    module.search_bars = load_search_bars(conn, id).await?;
    module.variables = load_variables(conn, id).await?;
    module.widgets = load_widgets(conn, id).await?;

    Ok(module)
}

async fn load_articles(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Article>> {
    let rows = sqlx::query("SELECT id, name FROM app.article WHERE module_id = $1 ORDER BY name")
        .bind(module_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(Article {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                name: row.try_get("name").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_relations(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Relation>> {
    let rows = sqlx::query(
        "SELECT id, name, comment, encryption, retention_count, retention_days
         FROM app.relation WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    let mut relations = Vec::with_capacity(rows.len());
    for row in rows {
        let relation_id: Uuid = row.try_get("id").map_err(classify_db_error)?;
        relations.push(Relation {
            id: relation_id,
            module_id: *module_id,
            name: row.try_get("name").map_err(classify_db_error)?,
            comment: row.try_get("comment").map_err(classify_db_error)?,
            encryption: row.try_get("encryption").map_err(classify_db_error)?,
            retention_count: row.try_get("retention_count").map_err(classify_db_error)?,
            retention_days: row.try_get("retention_days").map_err(classify_db_error)?,
            attributes: load_attributes(conn, &relation_id).await?,
            indexes: load_indexes(conn, &relation_id).await?,
            presets: load_presets(conn, &relation_id).await?,
            policies: load_policies(conn, &relation_id).await?,
            triggers: load_triggers(conn, &relation_id, module_id).await?,
        });
    }
    Ok(relations)
}

async fn load_attributes(conn: &mut PgConnection, relation_id: &Uuid) -> Result<Vec<Attribute>> {
    let rows = sqlx::query(
        "SELECT id, relationship_id, icon_id, name, content::TEXT AS content,
                content_use::TEXT AS content_use, length, nullable, encrypted,
                def, on_update, on_delete
         FROM app.attribute WHERE relation_id = $1 ORDER BY name",
    )
    .bind(relation_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            let content: String = row.try_get("content").map_err(classify_db_error)?;
            let content_use: String = row.try_get("content_use").map_err(classify_db_error)?;
            Ok(Attribute {
                id: row.try_get("id").map_err(classify_db_error)?,
                relation_id: *relation_id,
                relationship_id: row.try_get("relationship_id").map_err(classify_db_error)?,
                icon_id: row.try_get("icon_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                content: parse_enum::<AttributeContent>(&content)?,
                content_use: parse_enum::<AttributeContentUse>(&content_use)?,
                length: row.try_get("length").map_err(classify_db_error)?,
                nullable: row.try_get("nullable").map_err(classify_db_error)?,
                encrypted: row.try_get("encrypted").map_err(classify_db_error)?,
                def: row.try_get("def").map_err(classify_db_error)?,
                on_update: row.try_get("on_update").map_err(classify_db_error)?,
                on_delete: row.try_get("on_delete").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_indexes(conn: &mut PgConnection, relation_id: &Uuid) -> Result<Vec<RelationIndex>> {
    let rows = sqlx::query(
        "SELECT id, method, no_duplicates, auto_fki, primary_key, attribute_ids
         FROM app.relation_index WHERE relation_id = $1",
    )
    .bind(relation_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(RelationIndex {
                id: row.try_get("id").map_err(classify_db_error)?,
                relation_id: *relation_id,
                method: row.try_get("method").map_err(classify_db_error)?,
                no_duplicates: row.try_get("no_duplicates").map_err(classify_db_error)?,
                auto_fki: row.try_get("auto_fki").map_err(classify_db_error)?,
                primary_key: row.try_get("primary_key").map_err(classify_db_error)?,
                attribute_ids: row.try_get("attribute_ids").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_presets(conn: &mut PgConnection, relation_id: &Uuid) -> Result<Vec<Preset>> {
    let rows = sqlx::query(
        "SELECT id, name, protected FROM app.preset WHERE relation_id = $1 ORDER BY name",
    )
    .bind(relation_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    let mut presets = Vec::with_capacity(rows.len());
    for row in rows {
        let preset_id: Uuid = row.try_get("id").map_err(classify_db_error)?;
        let value_rows = sqlx::query(
            "SELECT id, attribute_id, preset_id_refer, protected, value
             FROM app.preset_value WHERE preset_id = $1",
        )
        .bind(preset_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_db_error)?;

        let values = value_rows
            .iter()
            .map(|v| {
                Ok(PresetValue {
                    id: v.try_get("id").map_err(classify_db_error)?,
                    preset_id,
                    attribute_id: v.try_get("attribute_id").map_err(classify_db_error)?,
                    preset_id_refer: v.try_get("preset_id_refer").map_err(classify_db_error)?,
                    protected: v.try_get("protected").map_err(classify_db_error)?,
                    value: v.try_get("value").map_err(classify_db_error)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        presets.push(Preset {
            id: preset_id,
            relation_id: *relation_id,
            name: row.try_get("name").map_err(classify_db_error)?,
            protected: row.try_get("protected").map_err(classify_db_error)?,
            values,
        });
    }
    Ok(presets)
}

async fn load_policies(conn: &mut PgConnection, relation_id: &Uuid) -> Result<Vec<Policy>> {
    let rows = sqlx::query(
        "SELECT position_order, role_id, pg_function_id_select, pg_function_id_update,
                pg_function_id_delete, action_select, action_update, action_delete
         FROM app.relation_policy WHERE relation_id = $1 ORDER BY position_order",
    )
    .bind(relation_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(Policy {
                relation_id: *relation_id,
                position: row.try_get("position_order").map_err(classify_db_error)?,
                role_id: row.try_get("role_id").map_err(classify_db_error)?,
                pg_function_id_select: row
                    .try_get("pg_function_id_select")
                    .map_err(classify_db_error)?,
                pg_function_id_update: row
                    .try_get("pg_function_id_update")
                    .map_err(classify_db_error)?,
                pg_function_id_delete: row
                    .try_get("pg_function_id_delete")
                    .map_err(classify_db_error)?,
                action_select: row.try_get("action_select").map_err(classify_db_error)?,
                action_update: row.try_get("action_update").map_err(classify_db_error)?,
                action_delete: row.try_get("action_delete").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_triggers(
    conn: &mut PgConnection,
    relation_id: &Uuid,
    module_id: &Uuid,
) -> Result<Vec<Trigger>> {
    let rows = sqlx::query(
        "SELECT id, pg_function_id, fires, on_insert, on_update, on_delete,
                is_constraint, is_deferrable, is_deferred, per_row, code_condition
         FROM app.trigger WHERE relation_id = $1",
    )
    .bind(relation_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(Trigger {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                relation_id: *relation_id,
                pg_function_id: row.try_get("pg_function_id").map_err(classify_db_error)?,
                fires: row.try_get("fires").map_err(classify_db_error)?,
                on_insert: row.try_get("on_insert").map_err(classify_db_error)?,
                on_update: row.try_get("on_update").map_err(classify_db_error)?,
                on_delete: row.try_get("on_delete").map_err(classify_db_error)?,
                is_constraint: row.try_get("is_constraint").map_err(classify_db_error)?,
                is_deferrable: row.try_get("is_deferrable").map_err(classify_db_error)?,
                is_deferred: row.try_get("is_deferred").map_err(classify_db_error)?,
                per_row: row.try_get("per_row").map_err(classify_db_error)?,
                code_condition: row.try_get("code_condition").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_forms(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Form>> {
    let rows = sqlx::query(
        "SELECT id, preset_id_open, icon_id, name, no_data_actions, query, fields
         FROM app.form WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            let query: serde_json::Value = row.try_get("query").map_err(classify_db_error)?;
            let fields: serde_json::Value = row.try_get("fields").map_err(classify_db_error)?;
            Ok(Form {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                preset_id_open: row.try_get("preset_id_open").map_err(classify_db_error)?,
                icon_id: row.try_get("icon_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                no_data_actions: row.try_get("no_data_actions").map_err(classify_db_error)?,
                query: serde_json::from_value::<Query>(query)?,
                fields: serde_json::from_value::<Vec<Field>>(fields)?,
            })
        })
        .collect()
}

async fn load_menu_tabs(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<MenuTab>> {
    let tab_rows = sqlx::query(
        "SELECT id, icon_id, position_order FROM app.menu_tab
         WHERE module_id = $1 ORDER BY position_order",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    let mut tabs = Vec::with_capacity(tab_rows.len());
    for row in tab_rows {
        let tab_id: Uuid = row.try_get("id").map_err(classify_db_error)?;

        let menu_rows = sqlx::query(
            "SELECT id, parent_id, form_id, icon_id, position_order, show_children
             FROM app.menu WHERE menu_tab_id = $1 ORDER BY position_order",
        )
        .bind(tab_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_db_error)?;

        let mut flat = Vec::with_capacity(menu_rows.len());
        for m in &menu_rows {
            flat.push(Menu {
                id: m.try_get("id").map_err(classify_db_error)?,
                menu_tab_id: tab_id,
                parent_id: m.try_get("parent_id").map_err(classify_db_error)?,
                form_id: m.try_get("form_id").map_err(classify_db_error)?,
                icon_id: m.try_get("icon_id").map_err(classify_db_error)?,
                position: m.try_get("position_order").map_err(classify_db_error)?,
                show_children: m.try_get("show_children").map_err(classify_db_error)?,
                menus: Vec::new(),
            });
        }

        tabs.push(MenuTab {
            id: tab_id,
            module_id: *module_id,
            icon_id: row.try_get("icon_id").map_err(classify_db_error)?,
            position: row.try_get("position_order").map_err(classify_db_error)?,
            menus: nest_menus(flat, None),
        });
    }
    Ok(tabs)
}

/// Rebuild the menu tree from the flat parent-linked rows.
fn nest_menus(flat: Vec<Menu>, parent: Option<Uuid>) -> Vec<Menu> {
    let mut out: Vec<Menu> = flat
        .iter()
        .filter(|m| m.parent_id == parent)
        .cloned()
        .collect();
    for menu in &mut out {
        menu.menus = nest_menus(flat.clone(), Some(menu.id));
    }
    out
}

async fn load_icons(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Icon>> {
    let rows = sqlx::query(
        "SELECT id, name, ENCODE(file, 'base64') AS file FROM app.icon WHERE module_id = $1",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(Icon {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                name: row.try_get("name").map_err(classify_db_error)?,
                file: row.try_get("file").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_roles(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Role>> {
    let rows = sqlx::query(
        "SELECT id, name, content::TEXT AS content, assignable
         FROM app.role WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    let mut roles = Vec::with_capacity(rows.len());
    for row in rows {
        let role_id: Uuid = row.try_get("id").map_err(classify_db_error)?;
        let content: String = row.try_get("content").map_err(classify_db_error)?;

        let child_ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT role_id_child FROM app.role_child WHERE role_id = $1")
                .bind(role_id)
                .fetch_all(&mut *conn)
                .await
                .map_err(classify_db_error)?;

        let mut role = Role {
            id: role_id,
            module_id: *module_id,
            name: row.try_get("name").map_err(classify_db_error)?,
            content: parse_enum::<RoleContent>(&content)?,
            assignable: row.try_get("assignable").map_err(classify_db_error)?,
            child_ids,
            access_relations: HashMap::new(),
            access_attributes: HashMap::new(),
            access_collections: HashMap::new(),
            access_menus: HashMap::new(),
            access_apis: HashMap::new(),
            access_client_events: HashMap::new(),
            access_search_bars: HashMap::new(),
            access_widgets: HashMap::new(),
        };

        let access_rows = sqlx::query(
            "SELECT relation_id, attribute_id, collection_id, menu_id, api_id,
                    client_event_id, search_bar_id, widget_id, access
             FROM app.role_access WHERE role_id = $1",
        )
        .bind(role_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_db_error)?;

        for a in &access_rows {
            let access: i16 = a.try_get("access").map_err(classify_db_error)?;
            if let Some(id) = a.try_get::<Option<Uuid>, _>("relation_id").map_err(classify_db_error)? {
                role.access_relations.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("attribute_id").map_err(classify_db_error)? {
                role.access_attributes.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("collection_id").map_err(classify_db_error)? {
                role.access_collections.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("menu_id").map_err(classify_db_error)? {
                role.access_menus.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("api_id").map_err(classify_db_error)? {
                role.access_apis.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("client_event_id").map_err(classify_db_error)? {
                role.access_client_events.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("search_bar_id").map_err(classify_db_error)? {
                role.access_search_bars.insert(id, access);
            } else if let Some(id) = a.try_get::<Option<Uuid>, _>("widget_id").map_err(classify_db_error)? {
                role.access_widgets.insert(id, access);
            }
        }

        roles.push(role);
    }
    Ok(roles)
}

async fn load_login_forms(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<LoginForm>> {
    let rows = sqlx::query(
        "SELECT id, form_id, attribute_id_login, attribute_id_lookup, name
         FROM app.login_form WHERE module_id = $1",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(LoginForm {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                form_id: row.try_get("form_id").map_err(classify_db_error)?,
                attribute_id_login: row
                    .try_get("attribute_id_login")
                    .map_err(classify_db_error)?,
                attribute_id_lookup: row
                    .try_get("attribute_id_lookup")
                    .map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_pg_functions(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<PgFunction>> {
    let rows = sqlx::query(
        "SELECT id, name, code_args, code_function, code_returns,
                is_frontend_exec, is_login_sync, is_trigger, cost
         FROM app.pg_function WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    let mut functions = Vec::with_capacity(rows.len());
    for row in rows {
        let function_id: Uuid = row.try_get("id").map_err(classify_db_error)?;

        let schedule_rows = sqlx::query(
            "SELECT id, at_second, at_minute, at_hour, at_day, interval_type, interval_value
             FROM app.pg_function_schedule WHERE pg_function_id = $1",
        )
        .bind(function_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_db_error)?;

        let schedules = schedule_rows
            .iter()
            .map(|s| {
                Ok(PgFunctionSchedule {
                    id: s.try_get("id").map_err(classify_db_error)?,
                    pg_function_id: function_id,
                    at_second: s.try_get("at_second").map_err(classify_db_error)?,
                    at_minute: s.try_get("at_minute").map_err(classify_db_error)?,
                    at_hour: s.try_get("at_hour").map_err(classify_db_error)?,
                    at_day: s.try_get("at_day").map_err(classify_db_error)?,
                    interval_type: s.try_get("interval_type").map_err(classify_db_error)?,
                    interval_value: s.try_get("interval_value").map_err(classify_db_error)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        functions.push(PgFunction {
            id: function_id,
            module_id: *module_id,
            name: row.try_get("name").map_err(classify_db_error)?,
            code_args: row.try_get("code_args").map_err(classify_db_error)?,
            code_function: row.try_get("code_function").map_err(classify_db_error)?,
            code_returns: row.try_get("code_returns").map_err(classify_db_error)?,
            is_frontend_exec: row.try_get("is_frontend_exec").map_err(classify_db_error)?,
            is_login_sync: row.try_get("is_login_sync").map_err(classify_db_error)?,
            is_trigger: row.try_get("is_trigger").map_err(classify_db_error)?,
            cost: row.try_get("cost").map_err(classify_db_error)?,
            schedules,
        });
    }
    Ok(functions)
}

async fn load_js_functions(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<JsFunction>> {
    let rows = sqlx::query(
        "SELECT id, form_id, name, code_args, code_function, code_returns, is_client_event_exec
         FROM app.js_function WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(JsFunction {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                form_id: row.try_get("form_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                code_args: row.try_get("code_args").map_err(classify_db_error)?,
                code_function: row.try_get("code_function").map_err(classify_db_error)?,
                code_returns: row.try_get("code_returns").map_err(classify_db_error)?,
                is_client_event_exec: row
                    .try_get("is_client_event_exec")
                    .map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_collections(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Collection>> {
    let rows = sqlx::query(
        "SELECT id, icon_id, name, query, columns
         FROM app.collection WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            let query: serde_json::Value = row.try_get("query").map_err(classify_db_error)?;
            let columns: serde_json::Value = row.try_get("columns").map_err(classify_db_error)?;
            Ok(Collection {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                icon_id: row.try_get("icon_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                query: serde_json::from_value::<Query>(query)?,
                columns: serde_json::from_value::<Vec<Column>>(columns)?,
            })
        })
        .collect()
}

async fn load_apis(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Api>> {
    let rows = sqlx::query(
        "SELECT id, name, version, has_delete, has_get, has_post, limit_def,
                limit_max, verbose_def, query, columns
         FROM app.api WHERE module_id = $1 ORDER BY name, version",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            let query: serde_json::Value = row.try_get("query").map_err(classify_db_error)?;
            let columns: serde_json::Value = row.try_get("columns").map_err(classify_db_error)?;
            Ok(Api {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                name: row.try_get("name").map_err(classify_db_error)?,
                version: row.try_get("version").map_err(classify_db_error)?,
                has_delete: row.try_get("has_delete").map_err(classify_db_error)?,
                has_get: row.try_get("has_get").map_err(classify_db_error)?,
                has_post: row.try_get("has_post").map_err(classify_db_error)?,
                limit_def: row.try_get("limit_def").map_err(classify_db_error)?,
                limit_max: row.try_get("limit_max").map_err(classify_db_error)?,
                verbose_def: row.try_get("verbose_def").map_err(classify_db_error)?,
                query: serde_json::from_value::<Query>(query)?,
                columns: serde_json::from_value::<Vec<Column>>(columns)?,
            })
        })
        .collect()
}

async fn load_client_events(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<ClientEvent>> {
    let rows = sqlx::query(
        "SELECT id, action, arguments, event, hotkey_modifier1, hotkey_modifier2,
                hotkey_char, js_function_id, pg_function_id
         FROM app.client_event WHERE module_id = $1",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(ClientEvent {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                action: row.try_get("action").map_err(classify_db_error)?,
                arguments: row.try_get("arguments").map_err(classify_db_error)?,
                event: row.try_get("event").map_err(classify_db_error)?,
                hotkey_modifier1: row.try_get("hotkey_modifier1").map_err(classify_db_error)?,
                hotkey_modifier2: row.try_get("hotkey_modifier2").map_err(classify_db_error)?,
                hotkey_char: row.try_get("hotkey_char").map_err(classify_db_error)?,
                js_function_id: row.try_get("js_function_id").map_err(classify_db_error)?,
                pg_function_id: row.try_get("pg_function_id").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_search_bars(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<SearchBar>> {
    let rows = sqlx::query(
        "SELECT id, icon_id, name, query, columns
         FROM app.search_bar WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            let query: serde_json::Value = row.try_get("query").map_err(classify_db_error)?;
            let columns: serde_json::Value = row.try_get("columns").map_err(classify_db_error)?;
            Ok(SearchBar {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                icon_id: row.try_get("icon_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                query: serde_json::from_value::<Query>(query)?,
                columns: serde_json::from_value::<Vec<Column>>(columns)?,
            })
        })
        .collect()
}

async fn load_variables(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Variable>> {
    let rows = sqlx::query(
        "SELECT id, form_id, name, content, content_use, def
         FROM app.variable WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(Variable {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                form_id: row.try_get("form_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                content: row.try_get("content").map_err(classify_db_error)?,
                content_use: row.try_get("content_use").map_err(classify_db_error)?,
                def: row.try_get("def").map_err(classify_db_error)?,
            })
        })
        .collect()
}

async fn load_widgets(conn: &mut PgConnection, module_id: &Uuid) -> Result<Vec<Widget>> {
    let rows = sqlx::query(
        "SELECT id, form_id, name, size, collection_id
         FROM app.widget WHERE module_id = $1 ORDER BY name",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(Widget {
                id: row.try_get("id").map_err(classify_db_error)?,
                module_id: *module_id,
                form_id: row.try_get("form_id").map_err(classify_db_error)?,
                name: row.try_get("name").map_err(classify_db_error)?,
                size: row.try_get("size").map_err(classify_db_error)?,
                collection: row.try_get("collection_id").map_err(classify_db_error)?,
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use sqlx::postgres::PgRow;

/// CHAR(n) columns come back space-padded; trim before use.
fn get_trimmed(row: &PgRow, column: &str) -> Result<String> {
    let value: String = row.try_get(column).map_err(classify_db_error)?;
    Ok(value.trim_end().to_string())
}

fn get_char_array(row: &PgRow, column: &str) -> Result<Vec<String>> {
    let values: Vec<String> = row.try_get(column).map_err(classify_db_error)?;
    Ok(values.into_iter().map(|v| v.trim_end().to_string()).collect())
}

/// Map a Postgres ENUM label onto its serde-tagged Rust enum.
fn parse_enum<T: serde::de::DeserializeOwned>(label: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(label.to_string())).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_enum_maps_pg_labels() {
        let content: AttributeContent = parse_enum("n:1").unwrap();
        assert_eq!(content, AttributeContent::RelN1);
        let content: AttributeContent = parse_enum("text").unwrap();
        assert_eq!(content, AttributeContent::Text);
        let role: RoleContent = parse_enum("everyone").unwrap();
        assert_eq!(role, RoleContent::Everyone);
        assert!(parse_enum::<AttributeContent>("no-such-kind").is_err());
    }

    #[test]
    fn nest_menus_rebuilds_tree() {
        let tab_id = Uuid::new_v4();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        let grandchild = Uuid::new_v4();

        let menu = |id: Uuid, parent: Option<Uuid>, pos: i32| Menu {
            id,
            menu_tab_id: tab_id,
            parent_id: parent,
            form_id: None,
            icon_id: None,
            position: pos,
            show_children: false,
            menus: vec![],
        };

        let flat = vec![
            menu(root, None, 0),
            menu(child, Some(root), 0),
            menu(grandchild, Some(child), 0),
        ];

        let tree = nest_menus(flat, None);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, root);
        assert_eq!(tree[0].menus.len(), 1);
        assert_eq!(tree[0].menus[0].id, child);
        assert_eq!(tree[0].menus[0].menus[0].id, grandchild);
    }
}
