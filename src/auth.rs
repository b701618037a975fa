//! Bearer credential handling: HS256 JWT mint/verify and the request extractor
//!
//! Access and refresh tokens share the signing key and are told apart by the
//! `iss` claim: the refresh endpoint only accepts `shitcord-refresh`, every
//! other authenticated route only accepts `shitcord`.

use anyhow::{anyhow, Result};
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::SharedState;

pub const ACCESS_ISSUER: &str = "shitcord";
pub const REFRESH_ISSUER: &str = "shitcord-refresh";

const REFRESH_LIFETIME_SECS: u64 = 30 * 24 * 3600;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub username: String,
    pub sub: String,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

/// Mint an access/refresh token pair for a user.
pub fn issue_token_pair(
    user_id: Uuid,
    username: &str,
    secret: &str,
    expiry_hours: u64,
) -> Result<(String, String)> {
    let now = now_secs();

    let access = sign_token(
        &Claims {
            user_id,
            username: username.to_string(),
            sub: user_id.to_string(),
            iss: ACCESS_ISSUER.to_string(),
            iat: now,
            exp: now + expiry_hours * 3600,
        },
        secret,
    )?;

    let refresh = sign_token(
        &Claims {
            user_id,
            username: username.to_string(),
            sub: user_id.to_string(),
            iss: REFRESH_ISSUER.to_string(),
            iat: now,
            exp: now + REFRESH_LIFETIME_SECS,
        },
        secret,
    )?;

    Ok((access, refresh))
}

/// Sign claims as a compact HS256 JWT.
pub fn sign_token(claims: &Claims, secret: &str) -> Result<String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(sign(signing_input.as_bytes(), secret.as_bytes()));
    Ok(format!("{signing_input}.{signature}"))
}

/// Verify signature, expiry, and issuer; returns the claims on success.
pub fn verify_token(token: &str, secret: &str, expected_iss: &str) -> Result<Claims> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(anyhow!("invalid token format"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|_| anyhow!("invalid token header encoding"))?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| anyhow!("invalid token header"))?;
    if header["alg"] != "HS256" {
        return Err(anyhow!("unexpected signing algorithm"));
    }

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| anyhow!("invalid token signature encoding"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| anyhow!("invalid token signature"))?;

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| anyhow!("invalid token payload encoding"))?;
    let claims: Claims =
        serde_json::from_slice(&payload).map_err(|_| anyhow!("invalid token claims"))?;

    if claims.exp <= now_secs() {
        return Err(anyhow!("token expired"));
    }
    if claims.iss != expected_iss {
        return Err(anyhow!("unexpected token issuer"));
    }

    Ok(claims)
}

fn sign(input: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Authenticated identity attached to a request by the bearer middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
}

#[async_trait]
impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .or_else(|| auth_header.strip_prefix("bearer "))
            .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;

        let claims = verify_token(token, &state.config.jwt_secret, ACCESS_ISSUER)
            .map_err(|_| ApiError::unauthorized("Invalid or expired token"))?;

        Ok(AuthUser {
            user_id: claims.user_id,
            username: claims.username,
        })
    }
}
