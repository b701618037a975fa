//! Role-based permissions for server operations
//!
//! Roles form a total order `member < moderator < admin < owner`; a handler
//! that requires a minimum role admits any member at or above it.

use serde::{Deserialize, Serialize};

/// Role of a user within a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Moderator,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Role::Member),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }

    /// Numeric level backing the total order.
    pub fn level(&self) -> u8 {
        match self {
            Role::Member => 1,
            Role::Moderator => 2,
            Role::Admin => 3,
            Role::Owner => 4,
        }
    }
}

/// Check whether `role` meets the required minimum.
pub fn has_min_role(role: Role, min: Role) -> bool {
    role >= min
}
