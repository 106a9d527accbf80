//! Authorization: the login's effective role set checked against the
//! per-entity access maps. Every check runs before any SQL touches user
//! data; an insufficient grant fails with `Unauthorized`.

use std::collections::HashSet;

use sqlx::PgConnection;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_domain::schema::{ACCESS_DELETE, ACCESS_READ, ACCESS_WRITE};
use bp_schema::SchemaCache;

/// Roles assigned to the login directly.
pub async fn assigned_role_ids(conn: &mut PgConnection, login_id: i64) -> Result<Vec<Uuid>> {
    sqlx::query_scalar("SELECT role_id FROM instance.login_role WHERE login_id = $1")
        .bind(login_id)
        .fetch_all(conn)
        .await
        .map_err(classify_db_error)
}

/// Effective role set: the assigned roles, every `everyone` role, and all
/// transitively inherited child roles. The walk is cycle-safe.
pub fn effective_role_ids(schema: &SchemaCache, assigned: &[Uuid]) -> HashSet<Uuid> {
    let mut effective: HashSet<Uuid> = HashSet::new();
    let mut stack: Vec<Uuid> = assigned.to_vec();
    stack.extend(schema.role_ids_everyone());

    while let Some(role_id) = stack.pop() {
        if !effective.insert(role_id) {
            continue;
        }
        if let Some(role) = schema.role(&role_id) {
            stack.extend(role.child_ids.iter().copied());
        }
    }
    effective
}

/// Highest relation grant across the role set.
pub fn relation_access(schema: &SchemaCache, roles: &HashSet<Uuid>, relation_id: &Uuid) -> i16 {
    roles
        .iter()
        .filter_map(|role_id| schema.role(role_id))
        .map(|role| role.access_relation(relation_id))
        .max()
        .unwrap_or(0)
}

/// Highest attribute grant across the role set.
pub fn attribute_access(schema: &SchemaCache, roles: &HashSet<Uuid>, attribute_id: &Uuid) -> i16 {
    roles
        .iter()
        .filter_map(|role_id| schema.role(role_id))
        .map(|role| role.access_attribute(attribute_id))
        .max()
        .unwrap_or(0)
}

/// Flat grant on collections, APIs, menus, client events, search bars or
/// widgets; `pick` selects the entity's entry from a role's access map.
pub fn entity_access<F>(schema: &SchemaCache, roles: &HashSet<Uuid>, pick: F) -> i16
where
    F: Fn(&bp_domain::schema::Role) -> Option<i16>,
{
    roles
        .iter()
        .filter_map(|role_id| schema.role(role_id))
        .filter_map(|role| pick(&role))
        .max()
        .unwrap_or(0)
}

pub fn require_client_event_access(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    client_event_id: &Uuid,
) -> Result<()> {
    if entity_access(schema, roles, |role| {
        role.access_client_events.get(client_event_id).copied()
    }) >= ACCESS_READ
    {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

pub fn require_relation_read(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    relation_id: &Uuid,
) -> Result<()> {
    if relation_access(schema, roles, relation_id) >= ACCESS_READ {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

pub fn require_relation_write(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    relation_id: &Uuid,
) -> Result<()> {
    if relation_access(schema, roles, relation_id) >= ACCESS_WRITE {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

pub fn require_relation_delete(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    relation_id: &Uuid,
) -> Result<()> {
    if relation_access(schema, roles, relation_id) >= ACCESS_DELETE {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

pub fn require_attribute_read(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    attribute_id: &Uuid,
) -> Result<()> {
    if attribute_access(schema, roles, attribute_id) >= ACCESS_READ {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

pub fn require_attribute_write(
    schema: &SchemaCache,
    roles: &HashSet<Uuid>,
    attribute_id: &Uuid,
) -> Result<()> {
    if attribute_access(schema, roles, attribute_id) >= ACCESS_WRITE {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_domain::schema::{Module, Role, RoleContent};
    use std::collections::HashMap;

    fn role(module_id: Uuid, content: RoleContent, children: Vec<Uuid>) -> Role {
        Role {
            id: Uuid::new_v4(),
            module_id,
            name: format!("r-{}", Uuid::new_v4()),
            content,
            assignable: true,
            child_ids: children,
            access_relations: HashMap::new(),
            access_attributes: HashMap::new(),
            access_collections: HashMap::new(),
            access_menus: HashMap::new(),
            access_apis: HashMap::new(),
            access_client_events: HashMap::new(),
            access_search_bars: HashMap::new(),
            access_widgets: HashMap::new(),
        }
    }

    fn module_with_roles(roles: Vec<Role>) -> Module {
        let module_id = roles[0].module_id;
        Module {
            id: module_id,
            parent_id: None,
            form_id: None,
            icon_id: None,
            name: format!("m-{module_id}"),
            name_display: None,
            color1: None,
            position: 0,
            language_main: "en_us".into(),
            release_build: 0,
            release_build_app: 0,
            release_date: 0,
            languages: vec![],
            dependencies: vec![],
            articles: vec![],
            relations: vec![],
            forms: vec![],
            menu_tabs: vec![],
            icons: vec![],
            roles,
            login_forms: vec![],
            pg_functions: vec![],
            js_functions: vec![],
            collections: vec![],
            apis: vec![],
            client_events: vec![],
            search_bars: vec![],
            variables: vec![],
            widgets: vec![],
        }
    }

    #[test]
    fn inherited_roles_resolve_transitively() {
        let module_id = Uuid::new_v4();
        let relation_id = Uuid::new_v4();

        let mut grandchild = role(module_id, RoleContent::User, vec![]);
        grandchild.access_relations.insert(relation_id, ACCESS_WRITE);
        let child = role(module_id, RoleContent::User, vec![grandchild.id]);
        let parent = role(module_id, RoleContent::User, vec![child.id]);
        let parent_id = parent.id;

        let schema = SchemaCache::new();
        schema.publish_module(module_with_roles(vec![parent, child, grandchild]));

        let roles = effective_role_ids(&schema, &[parent_id]);
        assert_eq!(roles.len(), 3);
        assert_eq!(relation_access(&schema, &roles, &relation_id), ACCESS_WRITE);
    }

    #[test]
    fn role_cycles_terminate() {
        let module_id = Uuid::new_v4();
        let mut a = role(module_id, RoleContent::User, vec![]);
        let mut b = role(module_id, RoleContent::User, vec![]);
        a.child_ids = vec![b.id];
        b.child_ids = vec![a.id];
        let a_id = a.id;

        let schema = SchemaCache::new();
        schema.publish_module(module_with_roles(vec![a, b]));

        let roles = effective_role_ids(&schema, &[a_id]);
        assert_eq!(roles.len(), 2);
    }

    #[test]
    fn everyone_roles_apply_to_all_logins() {
        let module_id = Uuid::new_v4();
        let relation_id = Uuid::new_v4();
        let mut everyone = role(module_id, RoleContent::Everyone, vec![]);
        everyone.access_relations.insert(relation_id, ACCESS_READ);

        let schema = SchemaCache::new();
        schema.publish_module(module_with_roles(vec![everyone]));

        // No assigned roles at all: the everyone grant still applies.
        let roles = effective_role_ids(&schema, &[]);
        assert!(require_relation_read(&schema, &roles, &relation_id).is_ok());
        assert!(require_relation_write(&schema, &roles, &relation_id).is_err());
    }

    #[test]
    fn missing_grants_deny_before_sql() {
        let schema = SchemaCache::new();
        let roles = effective_role_ids(&schema, &[]);
        let relation_id = Uuid::new_v4();
        assert!(matches!(
            require_relation_read(&schema, &roles, &relation_id),
            Err(Error::Unauthorized)
        ));
        assert!(matches!(
            require_attribute_write(&schema, &roles, &Uuid::new_v4()),
            Err(Error::Unauthorized)
        ));
    }
}
