// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token minting and verification.
//!
//! Tokens are compact HS256 credentials: `base64url(header).base64url
//! (claims).base64url(hmac)`. User access tokens sign under the access
//! secret; agent tokens carry a `kid` header naming the rotating agent key
//! they were signed with, so verification survives key rotation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::config::KeySet;

/// Token verification failures. All map to `unauthenticated` at the API
/// boundary; the distinction matters for channel close reasons and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    UnknownKid,
    BadSignature,
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed token"),
            Self::UnknownKid => f.write_str("unknown kid"),
            Self::BadSignature => f.write_str("bad signature"),
            Self::Expired => f.write_str("token expired"),
        }
    }
}

impl std::error::Error for TokenError {}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// Claims carried by a user access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims carried by an agent token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentClaims {
    pub agent_id: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mint a user access token. Returns `(token, jti)`.
pub fn mint_access(secret: &str, user_id: &str, ttl_minutes: u64) -> (String, String) {
    let jti = uuid::Uuid::new_v4().simple().to_string();
    let now = Utc::now().timestamp();
    let claims = AccessClaims {
        sub: user_id.to_owned(),
        jti: jti.clone(),
        iat: now,
        exp: now + (ttl_minutes as i64) * 60,
    };
    (encode(secret, None, &claims), jti)
}

/// Verify a user access token and return its claims.
pub fn verify_access(secret: &str, token: &str) -> Result<AccessClaims, TokenError> {
    let (_, claims) = decode::<AccessClaims>(token, |_| Some(secret.to_owned()))?;
    if claims.exp <= Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

/// Mint an agent token under the active key. Returns `(token, jti, kid)`.
pub fn mint_agent(
    keys: &KeySet,
    active_kid: &str,
    agent_id: &str,
    ttl_hours: u64,
) -> Result<(String, String, String), TokenError> {
    let secret = keys.get(active_kid).ok_or(TokenError::UnknownKid)?;
    let jti = uuid::Uuid::new_v4().simple().to_string();
    let now = Utc::now().timestamp();
    let claims = AgentClaims {
        agent_id: agent_id.to_owned(),
        jti: jti.clone(),
        iat: now,
        exp: now + (ttl_hours as i64) * 3600,
    };
    Ok((encode(secret, Some(active_kid), &claims), jti, active_kid.to_owned()))
}

/// Verify an agent token, resolving the secret via its `kid` header.
pub fn verify_agent(keys: &KeySet, token: &str) -> Result<AgentClaims, TokenError> {
    // A token without a kid header resolves no secret and fails here.
    let (_, claims) = decode::<AgentClaims>(token, |header| {
        header.kid.as_deref().and_then(|kid| keys.get(kid)).map(str::to_owned)
    })?;
    if claims.exp <= Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

/// Generate a refresh token. Returns `(raw, sha256_hex)`; only the hash is
/// ever persisted.
pub fn new_refresh_token() -> (String, String) {
    let raw = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let hashed = hash_refresh_token(&raw);
    (raw, hashed)
}

/// SHA-256 hex digest of a raw refresh token, for storage and lookup.
pub fn hash_refresh_token(raw: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn encode<C: Serialize>(secret: &str, kid: Option<&str>, claims: &C) -> String {
    let header = Header {
        alg: "HS256".to_owned(),
        typ: "JWT".to_owned(),
        kid: kid.map(str::to_owned),
    };
    // Serialization of these fixed shapes cannot fail.
    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
    let claims_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    let signing_input = format!("{header_b64}.{claims_b64}");
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, signing_input.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(tag.as_ref());
    format!("{signing_input}.{sig_b64}")
}

fn decode<C: for<'de> Deserialize<'de>>(
    token: &str,
    secret_for: impl Fn(&Header) -> Option<String>,
) -> Result<(Header, C), TokenError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| TokenError::Malformed)?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
    if header.alg != "HS256" {
        return Err(TokenError::Malformed);
    }

    let secret = secret_for(&header).ok_or(TokenError::UnknownKid)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::Malformed)?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, signing_input.as_bytes(), &sig).map_err(|_| TokenError::BadSignature)?;

    let claims_bytes = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| TokenError::Malformed)?;
    let claims: C = serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;
    Ok((header, claims))
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
