//! In-memory schema cache.
//!
//! One `parking_lot::RwLock` guards every map; the derived id maps and the
//! per-module JSON snapshots are only ever mutated together, so a reader
//! holding the lock observes a consistent state:
//!
//! - every key in the JSON map has a counterpart in the module map
//! - attributes resolve to relations of their owning module
//! - the API name map mirrors the API id map
//! - removing a module purges it from every derived map

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use bp_domain::schema::{
    Api, Attribute, ClientEvent, Module, ModuleMeta, PgFunction, Relation, Role,
};

#[derive(Default)]
struct CacheInner {
    module_id_map: HashMap<Uuid, Arc<Module>>,
    module_json_map: HashMap<Uuid, Arc<String>>,
    module_meta_map: HashMap<Uuid, ModuleMeta>,

    // Derived id maps, repopulated from the module payload on every update.
    relation_id_map: HashMap<Uuid, Relation>,
    attribute_id_map: HashMap<Uuid, Attribute>,
    role_id_map: HashMap<Uuid, Role>,
    pg_function_id_map: HashMap<Uuid, PgFunction>,
    api_id_map: HashMap<Uuid, Api>,
    client_event_id_map: HashMap<Uuid, ClientEvent>,

    // moduleName → "apiName.vN" → apiId
    module_api_name_map: HashMap<String, HashMap<String, Uuid>>,

    /// Unix timestamp of the last successful schema change, pushed to
    /// clients with `schemaLoaded`.
    timestamp: i64,
}

pub struct SchemaCache {
    inner: RwLock<CacheInner>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Writers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Publish one fully loaded module. The module replaces any previous
    /// version of itself in the module map and in every derived map. The JSON
    /// snapshot is regenerated separately once the whole update set is in
    /// place ([`Self::regenerate_json`]).
    pub fn publish_module(&self, module: Module) {
        let mut inner = self.inner.write();
        let id = module.id;

        Self::purge_derived(&mut inner, &id);

        for relation in &module.relations {
            for attribute in &relation.attributes {
                inner
                    .attribute_id_map
                    .insert(attribute.id, attribute.clone());
            }
            inner.relation_id_map.insert(relation.id, relation.clone());
        }
        for role in &module.roles {
            inner.role_id_map.insert(role.id, role.clone());
        }
        for function in &module.pg_functions {
            inner.pg_function_id_map.insert(function.id, function.clone());
        }
        for event in &module.client_events {
            inner.client_event_id_map.insert(event.id, event.clone());
        }

        let mut api_names = HashMap::with_capacity(module.apis.len());
        for api in &module.apis {
            inner.api_id_map.insert(api.id, api.clone());
            api_names.insert(api.versioned_name(), api.id);
        }
        inner.module_api_name_map.insert(module.name.clone(), api_names);

        inner.module_id_map.insert(id, Arc::new(module));
    }

    /// Serialise the stored modules into their transfer snapshots and bump
    /// the schema timestamp. Called after every successful update set.
    pub fn regenerate_json(&self, module_ids: &[Uuid]) -> bp_domain::Result<i64> {
        let mut inner = self.inner.write();
        for id in module_ids {
            let Some(module) = inner.module_id_map.get(id) else {
                continue;
            };
            let json = serde_json::to_string(module.as_ref())?;
            inner.module_json_map.insert(*id, Arc::new(json));
        }
        inner.timestamp = Utc::now().timestamp();
        Ok(inner.timestamp)
    }

    /// Replace the module meta map and remove modules that disappeared from
    /// it, purging them from every map.
    pub fn replace_meta(&self, meta: HashMap<Uuid, ModuleMeta>) -> Vec<Uuid> {
        let mut inner = self.inner.write();

        let removed: Vec<Uuid> = inner
            .module_meta_map
            .keys()
            .filter(|id| !meta.contains_key(id))
            .copied()
            .collect();

        for id in &removed {
            let name = inner
                .module_id_map
                .remove(id)
                .map(|m| m.name.clone());
            inner.module_json_map.remove(id);
            if let Some(name) = name {
                inner.module_api_name_map.remove(&name);
            }
            Self::purge_derived(&mut inner, id);
        }

        inner.module_meta_map = meta;
        removed
    }

    fn purge_derived(inner: &mut CacheInner, module_id: &Uuid) {
        // Attributes hang off relations; resolve the owning module through
        // the relation map before it is pruned.
        let relation_ids: Vec<Uuid> = inner
            .relation_id_map
            .values()
            .filter(|r| r.module_id == *module_id)
            .map(|r| r.id)
            .collect();
        inner
            .attribute_id_map
            .retain(|_, a| !relation_ids.contains(&a.relation_id));
        inner.relation_id_map.retain(|_, r| r.module_id != *module_id);
        inner.role_id_map.retain(|_, r| r.module_id != *module_id);
        inner
            .pg_function_id_map
            .retain(|_, f| f.module_id != *module_id);
        inner.api_id_map.retain(|_, a| a.module_id != *module_id);
        inner
            .client_event_id_map
            .retain(|_, e| e.module_id != *module_id);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Readers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn module(&self, id: &Uuid) -> Option<Arc<Module>> {
        self.inner.read().module_id_map.get(id).cloned()
    }

    pub fn module_ids(&self) -> Vec<Uuid> {
        self.inner.read().module_id_map.keys().copied().collect()
    }

    pub fn module_json(&self, id: &Uuid) -> Option<Arc<String>> {
        self.inner.read().module_json_map.get(id).cloned()
    }

    pub fn module_id_by_name(&self, name: &str) -> Option<Uuid> {
        self.inner
            .read()
            .module_id_map
            .values()
            .find(|m| m.name == name)
            .map(|m| m.id)
    }

    pub fn meta(&self) -> HashMap<Uuid, ModuleMeta> {
        self.inner.read().module_meta_map.clone()
    }

    pub fn meta_module_ids(&self) -> Vec<Uuid> {
        self.inner.read().module_meta_map.keys().copied().collect()
    }

    pub fn relation(&self, id: &Uuid) -> Option<Relation> {
        self.inner.read().relation_id_map.get(id).cloned()
    }

    pub fn attribute(&self, id: &Uuid) -> Option<Attribute> {
        self.inner.read().attribute_id_map.get(id).cloned()
    }

    /// Every file attribute in the schema; drives the file retention worker
    /// across the per-attribute record tables.
    pub fn attribute_ids_files(&self) -> Vec<Uuid> {
        use bp_domain::schema::AttributeContent;
        self.inner
            .read()
            .attribute_id_map
            .values()
            .filter(|a| a.content == AttributeContent::Files)
            .map(|a| a.id)
            .collect()
    }

    pub fn role(&self, id: &Uuid) -> Option<Role> {
        self.inner.read().role_id_map.get(id).cloned()
    }

    /// Roles granted to every login regardless of assignment.
    pub fn role_ids_everyone(&self) -> Vec<Uuid> {
        use bp_domain::schema::RoleContent;
        self.inner
            .read()
            .role_id_map
            .values()
            .filter(|r| r.content == RoleContent::Everyone)
            .map(|r| r.id)
            .collect()
    }

    pub fn pg_function(&self, id: &Uuid) -> Option<PgFunction> {
        self.inner.read().pg_function_id_map.get(id).cloned()
    }

    pub fn api(&self, id: &Uuid) -> Option<Api> {
        self.inner.read().api_id_map.get(id).cloned()
    }

    pub fn api_id_by_name(&self, module_name: &str, versioned_name: &str) -> Option<Uuid> {
        self.inner
            .read()
            .module_api_name_map
            .get(module_name)
            .and_then(|apis| apis.get(versioned_name))
            .copied()
    }

    pub fn client_event(&self, id: &Uuid) -> Option<ClientEvent> {
        self.inner.read().client_event_id_map.get(id).cloned()
    }

    pub fn timestamp(&self) -> i64 {
        self.inner.read().timestamp
    }

    /// Consistency check used by tests and the loader's debug assertions:
    /// every JSON snapshot has its module, every attribute resolves through
    /// its relation to the attribute's owning module, the API name map
    /// mirrors the API id map.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.read();

        for id in inner.module_json_map.keys() {
            if !inner.module_id_map.contains_key(id) {
                return Err(format!("json snapshot without module: {id}"));
            }
        }
        for attribute in inner.attribute_id_map.values() {
            if !inner.relation_id_map.contains_key(&attribute.relation_id) {
                return Err(format!(
                    "attribute {} points at unknown relation {}",
                    attribute.id, attribute.relation_id
                ));
            }
        }
        for (module_name, apis) in &inner.module_api_name_map {
            for (versioned, api_id) in apis {
                let Some(api) = inner.api_id_map.get(api_id) else {
                    return Err(format!("api name map entry without api: {versioned}"));
                };
                if api.versioned_name() != *versioned {
                    return Err(format!(
                        "api name map mismatch in module {module_name}: {versioned}"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_domain::schema::{
        AttributeContent, AttributeContentUse, Query, RoleContent,
    };

    fn empty_query() -> Query {
        Query {
            id: Uuid::new_v4(),
            relation_id: None,
            fixed_limit: 0,
            joins: vec![],
            filters: vec![],
            orders: vec![],
        }
    }

    fn test_module(name: &str) -> Module {
        let module_id = Uuid::new_v4();
        let relation_id = Uuid::new_v4();
        Module {
            id: module_id,
            parent_id: None,
            form_id: None,
            icon_id: None,
            name: name.into(),
            name_display: None,
            color1: None,
            position: 0,
            language_main: "en_us".into(),
            release_build: 1,
            release_build_app: 1,
            release_date: 0,
            languages: vec!["en_us".into()],
            dependencies: vec![],
            articles: vec![],
            relations: vec![Relation {
                id: relation_id,
                module_id,
                name: "items".into(),
                comment: None,
                encryption: false,
                retention_count: None,
                retention_days: None,
                attributes: vec![Attribute {
                    id: Uuid::new_v4(),
                    relation_id,
                    relationship_id: None,
                    icon_id: None,
                    name: "title".into(),
                    content: AttributeContent::Text,
                    content_use: AttributeContentUse::Default,
                    length: 0,
                    nullable: true,
                    encrypted: false,
                    def: String::new(),
                    on_update: None,
                    on_delete: None,
                }],
                indexes: vec![],
                presets: vec![],
                policies: vec![],
                triggers: vec![],
            }],
            forms: vec![],
            menu_tabs: vec![],
            icons: vec![],
            roles: vec![Role {
                id: Uuid::new_v4(),
                module_id,
                name: "everyone".into(),
                content: RoleContent::Everyone,
                assignable: false,
                child_ids: vec![],
                access_relations: HashMap::new(),
                access_attributes: HashMap::new(),
                access_collections: HashMap::new(),
                access_menus: HashMap::new(),
                access_apis: HashMap::new(),
                access_client_events: HashMap::new(),
                access_search_bars: HashMap::new(),
                access_widgets: HashMap::new(),
            }],
            login_forms: vec![],
            pg_functions: vec![],
            js_functions: vec![],
            collections: vec![],
            apis: vec![Api {
                id: Uuid::new_v4(),
                module_id,
                name: "items".into(),
                version: 1,
                has_delete: false,
                has_get: true,
                has_post: false,
                limit_def: 100,
                limit_max: 1000,
                verbose_def: false,
                query: empty_query(),
                columns: vec![],
            }],
            client_events: vec![],
            search_bars: vec![],
            variables: vec![],
            widgets: vec![],
        }
    }

    fn meta_for(module: &Module) -> ModuleMeta {
        ModuleMeta {
            module_id: module.id,
            hash: String::new(),
            release_build: 1,
            release_build_app: 1,
            release_date: 0,
            languages_custom: vec![],
            date_change: 0,
            owner: true,
            hidden: false,
            position: 0,
        }
    }

    #[test]
    fn publish_fills_derived_maps() {
        let cache = SchemaCache::new();
        let module = test_module("crm");
        let module_id = module.id;
        let relation_id = module.relations[0].id;
        let attribute_id = module.relations[0].attributes[0].id;
        let api_id = module.apis[0].id;

        cache.publish_module(module);
        cache.regenerate_json(&[module_id]).unwrap();

        assert!(cache.module(&module_id).is_some());
        assert!(cache.module_json(&module_id).is_some());
        assert!(cache.relation(&relation_id).is_some());
        assert!(cache.attribute(&attribute_id).is_some());
        assert_eq!(cache.api_id_by_name("crm", "items.v1"), Some(api_id));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn republish_replaces_stale_children() {
        let cache = SchemaCache::new();
        let mut module = test_module("crm");
        let module_id = module.id;
        let old_attribute = module.relations[0].attributes[0].id;

        cache.publish_module(module.clone());

        // New payload drops the attribute; the derived map must not keep it.
        module.relations[0].attributes.clear();
        cache.publish_module(module);
        cache.regenerate_json(&[module_id]).unwrap();

        assert!(cache.attribute(&old_attribute).is_none());
        cache.check_invariants().unwrap();
    }

    #[test]
    fn meta_reconciliation_removes_dropped_modules() {
        let cache = SchemaCache::new();
        let keep = test_module("keep");
        let drop_me = test_module("drop_me");
        let drop_id = drop_me.id;
        let drop_relation = drop_me.relations[0].id;
        let drop_api = drop_me.apis[0].id;

        let mut meta = HashMap::new();
        meta.insert(keep.id, meta_for(&keep));
        meta.insert(drop_me.id, meta_for(&drop_me));

        cache.publish_module(keep.clone());
        cache.publish_module(drop_me);
        cache
            .regenerate_json(&[keep.id, drop_id])
            .unwrap();
        cache.replace_meta(meta.clone());

        // The module disappears from meta: every map must drop it.
        meta.remove(&drop_id);
        let removed = cache.replace_meta(meta);
        assert_eq!(removed, vec![drop_id]);

        assert!(cache.module(&drop_id).is_none());
        assert!(cache.module_json(&drop_id).is_none());
        assert!(cache.relation(&drop_relation).is_none());
        assert!(cache.api(&drop_api).is_none());
        assert_eq!(cache.api_id_by_name("drop_me", "items.v1"), None);
        assert!(cache.module(&keep.id).is_some());
        cache.check_invariants().unwrap();
    }

    #[test]
    fn json_never_precedes_module() {
        // Regenerating for an id that was never published is a no-op, so a
        // snapshot can never exist without its module.
        let cache = SchemaCache::new();
        cache.regenerate_json(&[Uuid::new_v4()]).unwrap();
        cache.check_invariants().unwrap();
    }

    #[test]
    fn concurrent_readers_see_consistent_snapshots() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let cache = Arc::new(SchemaCache::new());
        let stop = Arc::new(AtomicBool::new(false));

        let reader_cache = cache.clone();
        let reader_stop = stop.clone();
        let reader = std::thread::spawn(move || {
            while !reader_stop.load(Ordering::Relaxed) {
                reader_cache.check_invariants().unwrap();
            }
        });

        for i in 0..200 {
            let module = test_module(&format!("mod{i}"));
            let id = module.id;
            cache.publish_module(module);
            cache.regenerate_json(&[id]).unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        cache.check_invariants().unwrap();
    }
}
