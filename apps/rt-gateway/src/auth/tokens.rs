//! Signed identity tokens (HS256 JWT) shared with the identity provider.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::principal::{Principal, Role};

/// Claims carried by a gateway identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User ID.
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Why a presented token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Invalid,
}

/// Validates tokens against the configured secret.
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify the signature and expiry, returning the claims.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        jsonwebtoken::decode::<TokenClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => {
                    tracing::debug!(?e, "token validation failed");
                    TokenError::Invalid
                }
            })
    }

    pub fn principal(&self, token: &str) -> Result<Principal, TokenError> {
        let claims = self.validate(token)?;
        Ok(Principal::user(claims.sub, claims.role))
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}

/// Mints tokens with the same secret. Used by operator tooling and tests.
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token valid for `ttl_secs` (negative values produce an already
    /// expired token).
    pub fn issue(&self, user_id: &str, role: Role, ttl_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            sub: user_id.to_string(),
            role,
            iat: now,
            exp: now + ttl_secs,
        };
        // Encoding a fixed claim struct with an HMAC key cannot fail.
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .unwrap_or_default()
    }
}

/// Pull a bearer token out of request headers.
///
/// Looks at `Authorization: Bearer <token>` first, then at the WebSocket
/// subprotocol pair `Sec-WebSocket-Protocol: bearer, <token>` used by browser
/// clients that cannot set headers. Query strings are never consulted.
pub fn extract_token(headers: &axum::http::HeaderMap) -> Option<String> {
    use axum::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};

    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    let protocols = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut parts = protocols.split(',').map(str::trim);
    match (parts.next(), parts.next()) {
        (Some("bearer"), Some(token)) if !token.is_empty() => Some(token.to_string()),
        _ => None,
    }
}
