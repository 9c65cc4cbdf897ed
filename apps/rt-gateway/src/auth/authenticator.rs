//! Resolves a connection attempt into a principal, consulting namespace policy.

use std::sync::Arc;

use crate::namespace::{NamespacePolicy, NamespaceRegistry};

use super::principal::Principal;
use super::tokens::{TokenError, TokenValidator};

/// Generic message shown to clients for every rejection.
pub const GENERIC_DENIAL: &str = "Authentication failed";

/// Specific rejection reason. Logged server-side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingToken,
    InvalidSignature,
    Expired,
    NamespaceForbidden,
}

impl AuthRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthRejection::MissingToken => "missing-token",
            AuthRejection::InvalidSignature => "invalid-signature",
            AuthRejection::Expired => "expired",
            AuthRejection::NamespaceForbidden => "namespace-forbidden",
        }
    }
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Authenticator {
    validator: TokenValidator,
    namespaces: Arc<NamespaceRegistry>,
}

impl Authenticator {
    pub fn new(secret: &str, namespaces: Arc<NamespaceRegistry>) -> Self {
        Self {
            validator: TokenValidator::new(secret),
            namespaces,
        }
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Authenticate a connection attempt against `namespace`.
    ///
    /// Unknown namespaces are the caller's concern; they are reported as
    /// forbidden here so nothing about them leaks either.
    pub fn authenticate(
        &self,
        namespace: &str,
        token: Option<&str>,
    ) -> Result<Principal, AuthRejection> {
        let policy = self
            .namespaces
            .get(namespace)
            .ok_or(AuthRejection::NamespaceForbidden)?;
        self.authenticate_with(policy, token)
    }

    pub fn authenticate_with(
        &self,
        policy: &NamespacePolicy,
        token: Option<&str>,
    ) -> Result<Principal, AuthRejection> {
        let principal = match token {
            None if policy.allow_anonymous => return Ok(Principal::anonymous()),
            None => return Err(AuthRejection::MissingToken),
            Some(token) => self.validator.principal(token).map_err(|e| match e {
                TokenError::Expired => AuthRejection::Expired,
                TokenError::Invalid => AuthRejection::InvalidSignature,
            })?,
        };

        if !principal.at_least(policy.min_role) {
            return Err(AuthRejection::NamespaceForbidden);
        }
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::principal::Role;
    use crate::auth::tokens::TokenIssuer;

    const SECRET: &str = "authenticator-test-secret";

    fn authenticator() -> Authenticator {
        Authenticator::new(SECRET, Arc::new(NamespaceRegistry::builtin()))
    }

    fn token(role: Role, ttl: i64) -> String {
        TokenIssuer::new(SECRET).issue("usr_42", role, ttl)
    }

    #[test]
    fn anonymous_allowed_on_anonymous_namespace() {
        let principal = authenticator().authenticate("prices", None).unwrap();
        assert!(principal.is_anonymous());
        assert_eq!(principal.role, Role::Guest);
    }

    #[test]
    fn anonymous_rejected_on_protected_namespace() {
        assert_eq!(
            authenticator().authenticate("tracking", None).unwrap_err(),
            AuthRejection::MissingToken
        );
    }

    #[test]
    fn valid_token_resolves_principal() {
        let principal = authenticator()
            .authenticate("tracking", Some(&token(Role::Standard, 60)))
            .unwrap();
        assert_eq!(principal.user_id.as_deref(), Some("usr_42"));
        assert_eq!(principal.role, Role::Standard);
    }

    #[test]
    fn expired_token_rejected() {
        assert_eq!(
            authenticator()
                .authenticate("tracking", Some(&token(Role::Standard, -600)))
                .unwrap_err(),
            AuthRejection::Expired
        );
    }

    #[test]
    fn tampered_token_rejected_even_on_anonymous_namespace() {
        let forged = TokenIssuer::new("someone-else").issue("usr_42", Role::Admin, 60);
        assert_eq!(
            authenticator()
                .authenticate("prices", Some(&forged))
                .unwrap_err(),
            AuthRejection::InvalidSignature
        );
    }

    #[test]
    fn under_privileged_role_is_forbidden() {
        assert_eq!(
            authenticator()
                .authenticate("admin-activity", Some(&token(Role::Moderator, 60)))
                .unwrap_err(),
            AuthRejection::NamespaceForbidden
        );
        assert!(authenticator()
            .authenticate("admin-activity", Some(&token(Role::SuperAdmin, 60)))
            .is_ok());
    }

    #[test]
    fn unknown_namespace_is_forbidden() {
        assert_eq!(
            authenticator()
                .authenticate("nope", Some(&token(Role::Admin, 60)))
                .unwrap_err(),
            AuthRejection::NamespaceForbidden
        );
    }
}
