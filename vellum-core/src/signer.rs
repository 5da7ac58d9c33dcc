//! Keyed-hash signatures over request paths.
//!
//! A token authorizes exactly one decoded path, optionally until an expiry
//! given in unix seconds. The MAC is HMAC-SHA256 over the path, followed by a
//! newline and the expiry when one is present, encoded as unpadded URL-safe
//! base64.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Reserved token that bypasses verification on unauthenticated deployments.
pub const UNSAFE_TOKEN: &str = "unsafe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub token: String,
    pub expiry: Option<i64>,
}

impl Signature {
    pub fn new(token: impl Into<String>, expiry: Option<i64>) -> Self {
        Self {
            token: token.into(),
            expiry,
        }
    }

    pub fn is_unsafe(&self) -> bool {
        self.token == UNSAFE_TOKEN
    }

    /// Query string carrying this signature, without the leading `?`.
    pub fn query(&self) -> String {
        match self.expiry {
            Some(expiry) => format!("x-signature={}&x-expire={}", self.token, expiry),
            None => format!("x-signature={}", self.token),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
    Expired,
}

impl Verification {
    pub fn is_valid(self) -> bool {
        self == Verification::Valid
    }
}

#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
    allow_unsafe: bool,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("allow_unsafe", &self.allow_unsafe)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            allow_unsafe: false,
        }
    }

    /// Accept [`UNSAFE_TOKEN`] for every path. Only for deployments that run
    /// without authentication.
    pub fn allow_unsafe(mut self, allow: bool) -> Self {
        self.allow_unsafe = allow;
        self
    }

    pub fn unsafe_allowed(&self) -> bool {
        self.allow_unsafe
    }

    pub fn sign(&self, path: &str, expiry: Option<DateTime<Utc>>) -> Signature {
        let expiry = expiry.map(|at| at.timestamp());
        let mac = self.mac(path, expiry).finalize().into_bytes();
        Signature::new(URL_SAFE_NO_PAD.encode(mac), expiry)
    }

    pub fn verify(&self, path: &str, signature: &Signature, now: DateTime<Utc>) -> Verification {
        if signature.is_unsafe() {
            return if self.allow_unsafe {
                Verification::Valid
            } else {
                Verification::Invalid
            };
        }

        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature.token.as_bytes()) else {
            return Verification::Invalid;
        };

        if self
            .mac(path, signature.expiry)
            .verify_slice(&provided)
            .is_err()
        {
            return Verification::Invalid;
        }

        match signature.expiry {
            Some(expiry) if expiry <= now.timestamp() => Verification::Expired,
            _ => Verification::Valid,
        }
    }

    fn mac(&self, path: &str, expiry: Option<i64>) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(path.as_bytes());
        if let Some(expiry) = expiry {
            mac.update(b"\n");
            mac.update(expiry.to_string().as_bytes());
        }
        mac
    }
}

pub fn sign(path: &str, secret: &str, expiry: Option<DateTime<Utc>>) -> Signature {
    Signer::new(secret).sign(path, expiry)
}

pub fn verify(path: &str, signature: &Signature, secret: &str, now: DateTime<Utc>) -> Verification {
    Signer::new(secret).verify(path, signature, now)
}

/// Constant-time comparison for shared secrets such as API keys.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    // Compare MACs of both values so the running time does not depend on
    // where, or whether, the lengths differ.
    let tag = |value: &str| {
        let mut mac = HmacSha256::new_from_slice(expected.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(value.as_bytes());
        mac
    };
    let expected_tag = tag(expected).finalize().into_bytes();
    tag(provided).verify_slice(&expected_tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sign_then_verify() {
        let now = Utc::now();
        let signature = sign("/blob/cats/tom.png", "s3cret", None);
        assert_eq!(
            verify("/blob/cats/tom.png", &signature, "s3cret", now),
            Verification::Valid
        );
        assert_eq!(signature.expiry, None);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let signature = sign("/blob/a.png", "one", None);
        assert_eq!(
            verify("/blob/a.png", &signature, "two", Utc::now()),
            Verification::Invalid
        );
    }

    #[test]
    fn test_other_path_is_invalid() {
        let signature = sign("/blob/a.png", "secret", None);
        assert_eq!(
            verify("/blob/b.png", &signature, "secret", Utc::now()),
            Verification::Invalid
        );
    }

    #[test]
    fn test_past_expiry_is_expired() {
        let now = Utc::now();
        let signature = sign("/blob/a.png", "secret", Some(now - Duration::seconds(5)));
        assert_eq!(
            verify("/blob/a.png", &signature, "secret", now),
            Verification::Expired
        );
    }

    #[test]
    fn test_future_expiry_is_valid() {
        let now = Utc::now();
        let signature = sign("/blob/a.png", "secret", Some(now + Duration::minutes(5)));
        assert_eq!(
            verify("/blob/a.png", &signature, "secret", now),
            Verification::Valid
        );
    }

    #[test]
    fn test_tampered_expiry_is_invalid() {
        let now = Utc::now();
        let mut signature = sign("/blob/a.png", "secret", Some(now - Duration::seconds(5)));
        signature.expiry = Some(now.timestamp() + 3600);
        assert_eq!(
            verify("/blob/a.png", &signature, "secret", now),
            Verification::Invalid
        );
    }

    #[test]
    fn test_garbage_token_is_invalid() {
        let signature = Signature::new("not base64 !!", None);
        assert_eq!(
            verify("/blob/a.png", &signature, "secret", Utc::now()),
            Verification::Invalid
        );
    }

    #[test]
    fn test_unsafe_token_requires_opt_in() {
        let unsafe_signature = Signature::new(UNSAFE_TOKEN, None);
        let strict = Signer::new("secret");
        let open = Signer::new("secret").allow_unsafe(true);

        assert_eq!(
            strict.verify("/blob/a.png", &unsafe_signature, Utc::now()),
            Verification::Invalid
        );
        assert_eq!(
            open.verify("/blob/a.png", &unsafe_signature, Utc::now()),
            Verification::Valid
        );
    }

    #[test]
    fn test_query_rendering() {
        let signature = Signature::new("abc", Some(42));
        assert_eq!(signature.query(), "x-signature=abc&x-expire=42");
        assert_eq!(Signature::new("abc", None).query(), "x-signature=abc");
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("hello", "hello"));
        assert!(!secrets_match("hello", "world"));
        assert!(!secrets_match("hello", "hell"));
        assert!(!secrets_match("", "hello"));
    }
}
