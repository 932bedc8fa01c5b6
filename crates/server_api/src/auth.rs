use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{UserId, UserProfile},
    error::{ApiError, ErrorCode},
};

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// Issues an HS256 bearer credential for `profile`.
pub fn issue_token(
    cfg: &AuthConfig,
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: profile.id.to_string(),
        name: profile.display_name.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(cfg.ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<UserProfile, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| ApiError::new(ErrorCode::Unauthorized, format!("invalid credential: {e}")))?;
    if data.claims.sub.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Unauthorized, "credential has no subject"));
    }
    Ok(UserProfile {
        id: UserId::new(data.claims.sub),
        display_name: data.claims.name,
    })
}

/// Extracts the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .or_else(|| header_value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
