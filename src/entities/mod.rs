// Entity Models - ledger records and cost objects
//
// Every cost object is referenced through a typed id. References are resolved
// once at ingestion into an `EntityRef`, never re-guessed at render time.

pub mod category;
pub mod project;
pub mod registry;
pub mod transaction;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use category::{Category, CategoryKind};
pub use project::{Client, Project, ProjectStatus};
pub use registry::{CostObjectRegistry, CostObjectSnapshot};
pub use transaction::Transaction;

// ============================================================================
// TYPED IDS
// ============================================================================

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_string())
            }
        }
    };
}

typed_id!(
    /// Externally issued ledger record id (immutable)
    TransactionId
);
typed_id!(ProjectId);
typed_id!(ClientId);
typed_id!(CategoryId);

// ============================================================================
// ENTITY REFERENCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Client,
}

/// A resolved reference to exactly one cost object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Project(ProjectId),
    Client(ClientId),
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Project(_) => EntityKind::Project,
            EntityRef::Client(_) => EntityKind::Client,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRef::Project(id) => id.as_str(),
            EntityRef::Client(id) => id.as_str(),
        }
    }

    /// Pick the attribution target from an optional project/client pair.
    /// A project wins over a client when both are named.
    pub fn from_pair(project: Option<&ProjectId>, client: Option<&ClientId>) -> Option<EntityRef> {
        match (project, client) {
            (Some(project), _) => Some(EntityRef::Project(project.clone())),
            (None, Some(client)) => Some(EntityRef::Client(client.clone())),
            (None, None) => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Project(id) => write!(f, "project:{}", id),
            EntityRef::Client(id) => write!(f, "client:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_wins_over_client() {
        let project = ProjectId::new("P1");
        let client = ClientId::new("C1");

        assert_eq!(
            EntityRef::from_pair(Some(&project), Some(&client)),
            Some(EntityRef::Project(project.clone()))
        );
        assert_eq!(
            EntityRef::from_pair(None, Some(&client)),
            Some(EntityRef::Client(client))
        );
        assert_eq!(EntityRef::from_pair(None, None), None);
    }

    #[test]
    fn test_entity_ref_serde_shape() {
        let entity = EntityRef::Client(ClientId::new("C9"));
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "client", "id": "C9"}));
        assert_eq!(entity.to_string(), "client:C9");
        assert_eq!(entity.kind(), EntityKind::Client);
    }
}
