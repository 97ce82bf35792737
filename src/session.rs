use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Member,
    Operator,
    Admin,
}

/// The signed-in user. Everything user-scoped is keyed by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: BTreeSet::from([Role::Member]),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|role| self.has_role(*role))
    }

    /// Directory-safe namespace for this user's local data.
    pub fn namespace(&self) -> String {
        let sanitized = self
            .user_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();
        if sanitized.is_empty() {
            "anonymous".to_string()
        } else {
            sanitized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Identity, Role};

    #[test]
    fn new_identities_are_members() {
        let identity = Identity::new("u-1").with_role(Role::Operator);
        assert!(identity.has_role(Role::Member));
        assert!(identity.has_any_role(&[Role::Admin, Role::Operator]));
        assert!(!identity.has_role(Role::Admin));
    }

    #[test]
    fn namespace_is_directory_safe() {
        assert_eq!(Identity::new("ada@example.com").namespace(), "ada_example_com");
        assert_eq!(Identity::new("../etc").namespace(), "___etc");
        assert_eq!(Identity::new("").namespace(), "anonymous");
    }
}
