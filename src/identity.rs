//! Credential verification.
//!
//! Tokens are minted elsewhere; this side only checks them. The shipped
//! adapter accepts HS256 JWTs whose `sub` (or legacy `id`) claim is the user
//! id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "id")]
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: u64,
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        JwtVerifier {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidCredential("empty subject".into()));
        }
        Ok(UserIdentity {
            user_id: data.claims.sub,
            name: data.claims.name,
        })
    }
}

/// Picks the credential out of an `Authorization: Bearer` header, falling
/// back to a `token` query parameter (browsers cannot set headers on a
/// WebSocket upgrade).
pub fn credential_from(header: Option<&str>, query_token: Option<&str>) -> Option<String> {
    header
        .and_then(|value| value.strip_prefix("Bearer "))
        .or(query_token)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Verifies a credential within the handshake window.
pub async fn authenticate(
    verifier: &Arc<dyn IdentityVerifier>,
    credential: Option<String>,
    window: Duration,
) -> Result<UserIdentity, AuthError> {
    let token = credential.ok_or(AuthError::MissingCredential)?;
    match tokio::time::timeout(window, verifier.verify(&token)).await {
        Ok(Ok(identity)) => {
            debug!("Authenticated {}", identity.user_id);
            Ok(identity)
        }
        Ok(Err(e)) => {
            warn!("Rejected credential: {}", e);
            Err(e)
        }
        Err(_) => {
            warn!("Credential verification exceeded {:?}", window);
            Err(AuthError::Timeout)
        }
    }
}
