#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-auth** – Short-lived control-plane tokens for workers.
//!
//! Workers call back into the control plane (service previews, automation
//! callbacks). Those calls authenticate with a short-lived HS256 JWT the
//! controller mints on every prompt dispatch and periodic credential
//! refresh, then pushes via `/update-ariana-token`. Tokens are scoped to
//! one agent and expire after roughly fifteen minutes.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ariana_types::{AgentId, UserId};

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 15 * 60;

/// Claim set embedded in every control-plane token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Owning user id.
    pub sub: String,
    /// Agent the token is scoped to.
    pub agent: String,
    /// Issued-at (seconds since Unix epoch).
    pub iat: u64,
    /// Expiry (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token id for replay protection.
    pub jti: String,
}

/// Token errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Encoding/decoding failed.
    #[error("token codec failure: {0}")]
    Codec(#[from] jsonwebtoken::errors::Error),
}

/// Mints and validates agent-scoped control-plane tokens.
#[derive(Clone)]
pub struct TokenMinter {
    secret: Secret<String>,
    ttl_secs: u64,
}

impl std::fmt::Debug for TokenMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMinter").field("ttl_secs", &self.ttl_secs).finish_non_exhaustive()
    }
}

impl TokenMinter {
    /// Build a minter over the plane-wide signing secret.
    pub fn new(secret: Secret<String>) -> Self {
        Self { secret, ttl_secs: DEFAULT_TOKEN_TTL_SECS }
    }

    /// Override the token lifetime.
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Mint a token scoped to one agent.
    pub fn mint(&self, user_id: UserId, agent_id: AgentId) -> Result<String, TokenError> {
        let now = Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: user_id.to_string(),
            agent: agent_id.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
            jti: Uuid::new_v4().to_string(),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("ariana+jwt".into());
        Ok(encode(
            &header,
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )?)
    }

    /// Validate a token (signature + expiry) and return its claims.
    pub fn validate(&self, raw: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        let data = decode::<Claims>(
            raw,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &validation,
        )?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minter() -> TokenMinter {
        TokenMinter::new(Secret::new("plane-secret".to_string()))
    }

    #[test]
    fn mint_then_validate_round_trip() {
        let minter = minter();
        let user = UserId::new();
        let agent = AgentId::new();

        let token = minter.mint(user, agent).unwrap();
        let claims = minter.validate(&token).unwrap();
        assert_eq!(claims.sub, user.to_string());
        assert_eq!(claims.agent, agent.to_string());
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = minter().mint(UserId::new(), AgentId::new()).unwrap();
        let other = TokenMinter::new(Secret::new("different".to_string()));
        assert!(other.validate(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let minter = minter().with_ttl_secs(0);
        let token = minter.mint(UserId::new(), AgentId::new()).unwrap();
        // exp == iat == now; zero leeway makes it immediately stale.
        assert!(minter.validate(&token).is_err());
    }

    #[test]
    fn tokens_are_unique_per_mint() {
        let minter = minter();
        let user = UserId::new();
        let agent = AgentId::new();
        let a = minter.mint(user, agent).unwrap();
        let b = minter.mint(user, agent).unwrap();
        let ca = minter.validate(&a).unwrap();
        let cb = minter.validate(&b).unwrap();
        assert_ne!(ca.jti, cb.jti);
    }
}
