use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::{Claims, TokenType};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::Error};
use uuid::Uuid;

fn now() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as usize)
        .unwrap_or_default()
}

fn issue(
    token_type: TokenType,
    user_id: u64,
    username: &str,
    role: u8,
    secret: &str,
    ttl: usize,
) -> Result<(String, Claims), Error> {
    let claims = Claims {
        user_id,
        sub: username.to_string(),
        role,
        exp: now() + ttl,
        jti: Uuid::new_v4().to_string(),
        token_type,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims))
}

pub fn generate_access_token(
    user_id: u64,
    username: &str,
    role: u8,
    secret: &str,
    ttl: usize,
) -> Result<String, Error> {
    issue(TokenType::Access, user_id, username, role, secret, ttl).map(|(token, _)| token)
}

/// The claims are returned so the caller can persist the `jti`.
pub fn generate_refresh_token(
    user_id: u64,
    username: &str,
    role: u8,
    secret: &str,
    ttl: usize,
) -> Result<(String, Claims), Error> {
    issue(TokenType::Refresh, user_id, username, role, secret, ttl)
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_carry_identity_and_type() {
        let access = generate_access_token(7, "jane", 2, "k", 60).unwrap();
        let claims = verify_token(&access, "k").unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.sub, "jane");
        assert_eq!(claims.role, 2);
        assert_eq!(claims.token_type, TokenType::Access);

        let (refresh, issued) = generate_refresh_token(7, "jane", 2, "k", 60).unwrap();
        let decoded = verify_token(&refresh, "k").unwrap();
        assert_eq!(decoded.jti, issued.jti);
        assert_eq!(decoded.token_type, TokenType::Refresh);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = generate_access_token(1, "a", 1, "right", 60).unwrap();
        assert!(verify_token(&token, "wrong").is_err());
    }
}
