//! Roles: named bundles of access grants, optionally inheriting from other
//! roles. Access maps are keyed by entity id; relation and attribute grants
//! are graded, everything else is a flat grant.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Graded access level for relations and attributes.
pub const ACCESS_NONE: i16 = 0;
pub const ACCESS_READ: i16 = 1;
pub const ACCESS_WRITE: i16 = 2;
pub const ACCESS_DELETE: i16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoleContent {
    Admin,
    User,
    Other,
    Everyone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub content: RoleContent,
    pub assignable: bool,
    /// Roles this role inherits all grants from, transitively.
    pub child_ids: Vec<Uuid>,
    pub access_relations: HashMap<Uuid, i16>,
    pub access_attributes: HashMap<Uuid, i16>,
    pub access_collections: HashMap<Uuid, i16>,
    pub access_menus: HashMap<Uuid, i16>,
    pub access_apis: HashMap<Uuid, i16>,
    pub access_client_events: HashMap<Uuid, i16>,
    pub access_search_bars: HashMap<Uuid, i16>,
    pub access_widgets: HashMap<Uuid, i16>,
}

impl Role {
    pub fn access_relation(&self, id: &Uuid) -> i16 {
        self.access_relations.get(id).copied().unwrap_or(ACCESS_NONE)
    }

    pub fn access_attribute(&self, id: &Uuid) -> i16 {
        self.access_attributes
            .get(id)
            .copied()
            .unwrap_or(ACCESS_NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_grant_is_no_access() {
        let role = Role {
            id: Uuid::new_v4(),
            module_id: Uuid::new_v4(),
            name: "reader".into(),
            content: RoleContent::User,
            assignable: true,
            child_ids: vec![],
            access_relations: HashMap::new(),
            access_attributes: HashMap::new(),
            access_collections: HashMap::new(),
            access_menus: HashMap::new(),
            access_apis: HashMap::new(),
            access_client_events: HashMap::new(),
            access_search_bars: HashMap::new(),
            access_widgets: HashMap::new(),
        };
        assert_eq!(role.access_relation(&Uuid::new_v4()), ACCESS_NONE);
    }
}
