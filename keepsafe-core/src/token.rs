//! Bearer tokens: HMAC-SHA256 signed assertions binding a session to a
//! user.
//!
//! A token is three base64url segments, `header.claims.signature`. The
//! header pins the signing algorithm; anything other than HS256 is
//! rejected outright so a forged header cannot downgrade verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_ALGORITHM: &str = "HS256";
const TOKEN_ISSUER: &str = "keepsafe";

/// Reasons a token fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unexpected signing algorithm")]
    WrongAlgorithm,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Assertion carried inside a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    pub iss: String,
}

/// Issues and verifies bearer tokens with a process-wide secret.
#[derive(Clone)]
pub struct TokenAuthority {
    secret: Vec<u8>,
    ttl_secs: i64,
}

impl TokenAuthority {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    /// Construct a signed assertion binding `user_id` and `username`,
    /// expiring `ttl_secs` from now.
    pub fn issue(&self, user_id: &str, username: &str) -> crate::Result<String> {
        let now = Utc::now().timestamp();
        let header = Header {
            alg: TOKEN_ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
            iss: TOKEN_ISSUER.to_string(),
        };

        let encode = |value: &[u8]| URL_SAFE_NO_PAD.encode(value);
        let header_json = serde_json::to_vec(&header)
            .map_err(|e| crate::Error::Internal(format!("token header: {e}")))?;
        let claims_json = serde_json::to_vec(&claims)
            .map_err(|e| crate::Error::Internal(format!("token claims: {e}")))?;

        let signing_input = format!("{}.{}", encode(&header_json), encode(&claims_json));
        let signature = self.sign(signing_input.as_bytes())?;
        Ok(format!("{signing_input}.{}", encode(&signature)))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (head, body, sig) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(b), Some(s), None) => (h, b, s),
            _ => return Err(TokenError::Malformed),
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(head)
            .map_err(|_| TokenError::Malformed)?;
        let header: Header =
            serde_json::from_slice(&header_json).map_err(|_| TokenError::Malformed)?;
        if header.alg != TOKEN_ALGORITHM {
            return Err(TokenError::WrongAlgorithm);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| TokenError::InvalidSignature)?;
        mac.update(format!("{head}.{body}").as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|_| TokenError::Malformed)?;

        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Read an `Authorization` value, require the bearer scheme, verify
    /// the token, and return the bound claims.
    ///
    /// This is the single authentication capability shared by the HTTP
    /// layer (header) and the RPC layer (call-envelope metadata).
    pub fn extract(&self, header_value: Option<&str>) -> crate::Result<Claims> {
        let value = header_value.ok_or_else(|| {
            crate::Error::Unauthenticated("authorization token is not supplied".into())
        })?;
        let token = bearer_token(value)
            .map_err(|e| crate::Error::Unauthenticated(e.to_string()))?;
        self.verify(token)
            .map_err(|e| crate::Error::Unauthenticated(e.to_string()))
    }

    fn sign(&self, input: &[u8]) -> crate::Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| crate::Error::Internal(format!("hmac key: {e}")))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Strip the (case-insensitive) `Bearer ` scheme from an authorization
/// value.
pub fn bearer_token(value: &str) -> Result<&str, TokenError> {
    let mut parts = value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token))
            if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() =>
        {
            Ok(token.trim())
        }
        _ => Err(TokenError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new("test-secret", 3600)
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let auth = authority();
        let token = auth.issue("user-1", "alice").unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iss, "keepsafe");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_rejected() {
        let auth = TokenAuthority::new("test-secret", -10);
        let token = auth.issue("user-1", "alice").unwrap();
        assert_eq!(auth.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn tampered_signature_rejected() {
        let auth = authority();
        let token = auth.issue("user-1", "alice").unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        let mut sig = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        sig[0] ^= 0x01;
        let forged = format!("{}.{}.{}", parts[0], parts[1], URL_SAFE_NO_PAD.encode(&sig));
        assert_eq!(auth.verify(&forged), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn token_signed_with_other_secret_rejected() {
        let token = authority().issue("user-1", "alice").unwrap();
        let other = TokenAuthority::new("other-secret", 3600);
        assert_eq!(other.verify(&token), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn tampered_claims_invalidate_signature() {
        let auth = authority();
        let token = auth.issue("user-1", "alice").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let claims = Claims {
            user_id: "user-2".into(),
            username: "mallory".into(),
            iat: 0,
            exp: i64::MAX,
            iss: "keepsafe".into(),
        };
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{}.{}.{}", parts[0], forged_body, parts[2]);
        assert_eq!(auth.verify(&forged), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn wrong_algorithm_rejected_before_signature_check() {
        let auth = authority();
        let token = auth.issue("user-1", "alice").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let forged = format!("{}.{}.{}", header, parts[1], parts[2]);
        assert_eq!(auth.verify(&forged), Err(TokenError::WrongAlgorithm));
    }

    #[test]
    fn garbage_tokens_are_malformed() {
        let auth = authority();
        for bad in ["", "abc", "a.b", "a.b.c.d", "!!.??.##"] {
            assert_eq!(auth.verify(bad), Err(TokenError::Malformed), "{bad:?}");
        }
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token("bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token("BEARER abc").unwrap(), "abc");
    }

    #[test]
    fn non_bearer_values_rejected() {
        assert!(bearer_token("Basic abc").is_err());
        assert!(bearer_token("Bearer").is_err());
        assert!(bearer_token("Bearer   ").is_err());
        assert!(bearer_token("").is_err());
    }

    #[test]
    fn extract_maps_failures_to_unauthenticated() {
        let auth = authority();
        assert!(matches!(
            auth.extract(None),
            Err(crate::Error::Unauthenticated(_))
        ));
        assert!(matches!(
            auth.extract(Some("Bearer nonsense")),
            Err(crate::Error::Unauthenticated(_))
        ));

        let token = auth.issue("user-1", "alice").unwrap();
        let claims = auth.extract(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(claims.user_id, "user-1");
    }
}
