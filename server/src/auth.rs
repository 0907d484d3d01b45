//! Bearer-token auth: `base64(nonce ‖ AES-GCM-seal(key, nonce, username))`
//! under the cluster secret. Validation recovers the username; there is no
//! per-token state.

use actix_web::dev::Payload;
use actix_web::http::header;
use actix_web::{web, FromRequest, HttpRequest};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use std::future::{ready, Ready};

use crate::errors::ApiError;
use crate::server::ChatServer;

/// AES-GCM standard nonce length.
pub const NONCE_SIZE: usize = 12;

pub fn generate_token(aead: &Aes128Gcm, username: &str) -> Result<String, ApiError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let sealed = aead
        .encrypt(Nonce::from_slice(&nonce), username.as_bytes())
        .map_err(|_| ApiError::BadRequest("failed to seal token".to_string()))?;

    let mut cipher_text = Vec::with_capacity(NONCE_SIZE + sealed.len());
    cipher_text.extend_from_slice(&nonce);
    cipher_text.extend_from_slice(&sealed);
    Ok(BASE64.encode(cipher_text))
}

pub fn parse_username(aead: &Aes128Gcm, token: &str) -> Option<String> {
    let cipher_text = BASE64.decode(token).ok()?;
    if cipher_text.len() < NONCE_SIZE {
        return None;
    }
    let (nonce, sealed) = cipher_text.split_at(NONCE_SIZE);
    let plain = aead.decrypt(Nonce::from_slice(nonce), sealed).ok()?;
    String::from_utf8(plain).ok()
}

/// The authenticated caller, recovered from the `Authorization` header.
///
/// The last whitespace-separated field of the header is the token, so both
/// `Bearer <token>` and a bare token are accepted.
pub struct AuthedUser {
    pub username: String,
}

impl FromRequest for AuthedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, ApiError>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_user(req))
    }
}

fn extract_user(req: &HttpRequest) -> Result<AuthedUser, ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = header
        .split_whitespace()
        .last()
        .ok_or(ApiError::TokenMissing)?;

    let server = req
        .app_data::<web::Data<ChatServer>>()
        .ok_or(ApiError::ClusterNotStarted)?;
    let aead = server.aead().ok_or(ApiError::ClusterNotStarted)?;

    match parse_username(aead, token) {
        Some(username) => Ok(AuthedUser { username }),
        None => Err(ApiError::TokenInvalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::KeyInit;

    fn cipher() -> Aes128Gcm {
        Aes128Gcm::new_from_slice(&[7u8; 16]).expect("16-byte key")
    }

    #[test]
    fn token_roundtrip() {
        let aead = cipher();
        for name in ["alice", "", "жучка", "a name with spaces"] {
            let token = generate_token(&aead, name).expect("generate");
            assert_eq!(parse_username(&aead, &token).as_deref(), Some(name));
        }
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let aead = cipher();
        let token = generate_token(&aead, "alice").expect("generate");
        let mut raw = BASE64.decode(&token).expect("valid base64");
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            assert!(parse_username(&aead, &BASE64.encode(&raw)).is_none(), "byte {i}");
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let aead = cipher();
        assert!(parse_username(&aead, "not base64 !!!").is_none());
        assert!(parse_username(&aead, &BASE64.encode(b"short")).is_none());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = generate_token(&cipher(), "alice").expect("generate");
        let other = Aes128Gcm::new_from_slice(&[8u8; 16]).expect("16-byte key");
        assert!(parse_username(&other, &token).is_none());
    }
}
