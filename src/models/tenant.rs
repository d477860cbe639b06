//! Tenant-tree read models. Created and mutated by the external CRUD
//! surface; the core only consumes them through the policy repository, so
//! these stay plain data carriers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub api_key_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub external_subject: String,
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Member,
    Viewer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde_labels() {
        assert_eq!(serde_json::to_value(UserRole::Admin).unwrap(), "admin");
        assert_eq!(serde_json::to_value(UserRole::Viewer).unwrap(), "viewer");
        let role: UserRole = serde_json::from_str("\"member\"").unwrap();
        assert_eq!(role, UserRole::Member);
    }
}
