//! Access guard evaluated in front of every protected route.
//!
//! Read routes accept, in order: a signature for the exact request path, a
//! valid API key (which mints a signature for the path), or no credential at
//! all when the deployment is public or in development. Write routes need a
//! valid signature or API key. API-key routes need the API key.

use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use vellum_core::{Result, Signature, Signer, UNSAFE_TOKEN, VellumError, Verification, secrets_match};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SIGNATURE_PARAM: &str = "x-signature";
pub const EXPIRE_PARAM: &str = "x-expire";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Read,
    Write,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Signature,
    ApiKey,
    Anonymous,
}

/// Inserted into request extensions once the guard allows a request.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub credential: Credential,
    /// Signature covering the request path: the one presented, one minted
    /// for an API key, or the reserved token for anonymous development reads.
    pub signature: Option<Signature>,
}

/// Credentials found on a request.
#[derive(Debug, Default, Clone)]
pub struct Evidence {
    pub signature: Option<Signature>,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SignatureQuery {
    #[serde(rename = "x-signature")]
    signature: Option<String>,
    #[serde(rename = "x-expire")]
    expire: Option<String>,
}

impl Evidence {
    /// Read `x-signature` / `x-expire` from the query (falling back to
    /// headers) and `x-api-key` from the headers. An unparsable expiry on a
    /// presented signature is rejected outright.
    pub fn from_request(headers: &HeaderMap, query: Option<&str>) -> Result<Self> {
        let query: SignatureQuery = query
            .and_then(|query| serde_urlencoded::from_str(query).ok())
            .unwrap_or_default();

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let token = query
            .signature
            .filter(|token| !token.is_empty())
            .or_else(|| header(SIGNATURE_PARAM));
        let expire = query
            .expire
            .filter(|expire| !expire.is_empty())
            .or_else(|| header(EXPIRE_PARAM));

        let signature = match token {
            Some(token) => {
                let expiry = match expire {
                    Some(expire) => Some(
                        expire
                            .trim()
                            .parse::<i64>()
                            .map_err(|_| VellumError::Unauthorized)?,
                    ),
                    None => None,
                };
                Some(Signature::new(token, expiry))
            }
            None => None,
        };

        Ok(Self {
            signature,
            api_key: header(API_KEY_HEADER),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    signer: Signer,
    api_key: Option<String>,
    public: bool,
    development: bool,
}

impl AccessPolicy {
    pub fn new(signer: Signer, api_key: Option<String>, public: bool, development: bool) -> Self {
        Self {
            signer,
            api_key,
            public,
            development,
        }
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn evaluate(
        &self,
        class: RouteClass,
        path: &str,
        evidence: &Evidence,
        now: DateTime<Utc>,
    ) -> Result<Authorized> {
        if class == RouteClass::ApiKey {
            let Some(expected) = self.api_key.as_deref() else {
                return Err(VellumError::Forbidden);
            };
            return match evidence.api_key.as_deref() {
                Some(provided) if secrets_match(provided, expected) => Ok(Authorized {
                    credential: Credential::ApiKey,
                    signature: None,
                }),
                _ => Err(VellumError::Unauthorized),
            };
        }

        if let Some(signature) = &evidence.signature {
            if signature.is_unsafe() && class != RouteClass::Read {
                tracing::debug!("Reserved token presented for {:?} route {}", class, path);
                return Err(VellumError::Unauthorized);
            }
            return match self.signer.verify(path, signature, now) {
                Verification::Valid => Ok(Authorized {
                    credential: Credential::Signature,
                    signature: Some(signature.clone()),
                }),
                Verification::Expired => {
                    tracing::debug!("Expired signature for {}", path);
                    Err(VellumError::Expired)
                }
                Verification::Invalid => {
                    tracing::debug!("Invalid signature for {}", path);
                    Err(VellumError::Unauthorized)
                }
            };
        }

        if let Some(provided) = evidence.api_key.as_deref() {
            return match self.api_key.as_deref() {
                Some(expected) if secrets_match(provided, expected) => Ok(Authorized {
                    credential: Credential::ApiKey,
                    signature: Some(self.signer.sign(path, None)),
                }),
                _ => Err(VellumError::Unauthorized),
            };
        }

        if class == RouteClass::Read && (self.public || self.development) {
            let signature = self
                .signer
                .unsafe_allowed()
                .then(|| Signature::new(UNSAFE_TOKEN, None));
            return Ok(Authorized {
                credential: Credential::Anonymous,
                signature,
            });
        }

        Err(VellumError::Unauthorized)
    }
}

/// Signed form of `path`, as handed out by `/sign` and `vellum sign`.
///
/// The signature covers the decoded path; the returned URL carries it
/// percent-encoded per segment.
pub fn signed_path(signer: &Signer, path: &str, expiry: Option<DateTime<Utc>>) -> String {
    let path = format!("/{}", path.trim_start_matches('/'));
    let signature = signer.sign(&path, expiry);
    let encoded = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}?{}", encoded, signature.query())
}

/// Percent-decoded request path, the form signatures are computed over.
pub fn decoded_path(uri: &Uri) -> Result<String> {
    urlencoding::decode(uri.path())
        .map(|path| path.into_owned())
        .map_err(|_| VellumError::InvalidRequest("request path is not valid UTF-8".to_string()))
}

#[derive(Clone)]
pub struct GuardState {
    pub policy: Arc<AccessPolicy>,
    pub class: RouteClass,
}

pub async fn access_guard(
    State(guard): State<GuardState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let path = decoded_path(request.uri())?;
    let evidence = Evidence::from_request(request.headers(), request.uri().query())?;
    let authorized = guard
        .policy
        .evaluate(guard.class, &path, &evidence, Utc::now())?;

    tracing::debug!("Allowed {:?} access to {} via {:?}", guard.class, path, authorized.credential);
    request.extensions_mut().insert(authorized);
    Ok(next.run(request).await)
}
