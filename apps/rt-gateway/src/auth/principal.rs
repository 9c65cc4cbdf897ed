//! Resolved identities attached to connections and HTTP requests.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Role tiers, ordered from least to most privileged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    #[serde(alias = "user")]
    Standard,
    /// Moderators and analysts share the mid tier.
    #[serde(alias = "analyst")]
    Moderator,
    Admin,
    #[serde(alias = "superadmin", alias = "super-admin")]
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Standard => "standard",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = serde_json::Error;

    /// Accepts the same names and aliases as token claims.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
    }
}

/// Identity resolved from a validated token, or an anonymous guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: Option<String>,
    pub role: Role,
}

impl Principal {
    pub fn user(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: Role::Guest,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn at_least(&self, role: Role) -> bool {
        self.role >= role
    }

    /// Rate-limit key: the user id when known, otherwise the remote address.
    pub fn limit_key(&self, remote_addr: &str) -> String {
        match &self.user_id {
            Some(id) => format!("user:{id}"),
            None => format!("ip:{remote_addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_ordered_by_privilege() {
        assert!(Role::Guest < Role::Standard);
        assert!(Role::Standard < Role::Moderator);
        assert!(Role::Moderator < Role::Admin);
        assert!(Role::Admin < Role::SuperAdmin);
    }

    #[test]
    fn role_aliases_deserialize() {
        let role: Role = serde_json::from_str("\"analyst\"").unwrap();
        assert_eq!(role, Role::Moderator);
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::Standard);
        let role: Role = serde_json::from_str("\"super-admin\"").unwrap();
        assert_eq!(role, Role::SuperAdmin);
        assert!(serde_json::from_str::<Role>("\"root\"").is_err());
    }

    #[test]
    fn roles_parse_from_cli_names() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("analyst".parse::<Role>().unwrap(), Role::Moderator);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn limit_key_prefers_user_id() {
        assert_eq!(
            Principal::user("usr_1", Role::Standard).limit_key("10.0.0.1"),
            "user:usr_1"
        );
        assert_eq!(Principal::anonymous().limit_key("10.0.0.1"), "ip:10.0.0.1");
    }
}
