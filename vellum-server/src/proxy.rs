use crate::access::{Authorized, Credential, EXPIRE_PARAM, SIGNATURE_PARAM};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, header};
use axum::response::Response;
use reqwest::Url;
use std::time::Duration;
use vellum_core::{Result, Signer, UNSAFE_TOKEN, VellumError};

/// Request headers passed through to the image service.
const FORWARDED_REQUEST_HEADERS: &[HeaderName] = &[
    header::ACCEPT,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
];

/// Response headers passed back to the client.
const FORWARDED_RESPONSE_HEADERS: &[HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CACHE_CONTROL,
    header::ETAG,
    header::LAST_MODIFIED,
    header::CONTENT_DISPOSITION,
    header::VARY,
    header::EXPIRES,
];

/// Forwards `/serve/{rest}` to the image-transformation service as
/// `GET {upstream}/{token}/{rest}`, where `token` is a signature over `rest`.
pub struct ServeProxy {
    client: reqwest::Client,
    upstream: Url,
    signer: Signer,
}

impl ServeProxy {
    pub fn new(upstream: &str, timeout: Duration, signer: Signer) -> Result<Self> {
        let upstream = Url::parse(upstream)
            .map_err(|e| VellumError::Config(format!("invalid upstream url {}: {}", upstream, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VellumError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            upstream,
            signer,
        })
    }

    /// Token the upstream will verify. Only a verified signature or API key
    /// earns a fresh signature for `rest`; anonymous requests and the
    /// reserved token forward the reserved token.
    pub fn upstream_token(&self, rest: &str, authorized: &Authorized) -> String {
        let reserved = authorized
            .signature
            .as_ref()
            .is_some_and(|signature| signature.is_unsafe());
        if reserved || authorized.credential == Credential::Anonymous {
            UNSAFE_TOKEN.to_string()
        } else {
            self.signer.sign(rest, None).token
        }
    }

    /// `raw_rest` is the still-encoded path after `/serve/`; `rest` is its
    /// decoded form, which the signature covers.
    pub fn upstream_url(&self, token: &str, raw_rest: &str, query: Option<&str>) -> Result<Url> {
        let base = self.upstream.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{}/{}/{}", base, token, raw_rest))
            .map_err(|e| VellumError::InvalidRequest(format!("invalid serve path: {}", e)))?;

        let forwarded = query.map(strip_signature_params).unwrap_or_default();
        url.set_query((!forwarded.is_empty()).then_some(forwarded.as_str()));
        Ok(url)
    }

    pub async fn forward(
        &self,
        raw_rest: &str,
        rest: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        authorized: &Authorized,
    ) -> Result<Response> {
        let token = self.upstream_token(rest, authorized);
        let url = self.upstream_url(&token, raw_rest, query)?;

        let mut request = self.client.get(url);
        for name in FORWARDED_REQUEST_HEADERS {
            if let Some(value) = headers.get(name) {
                request = request.header(name, value);
            }
        }

        let upstream = request
            .send()
            .await
            .map_err(|e| VellumError::Upstream(e.to_string()))?;

        let status = upstream.status();
        if status.is_server_error() {
            tracing::warn!("Image service answered {} for {}", status, rest);
        }

        let mut response = Response::builder().status(status);
        for name in FORWARDED_RESPONSE_HEADERS {
            if let Some(value) = upstream.headers().get(name) {
                response = response.header(name, value);
            }
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| VellumError::Internal(format!("failed to build proxy response: {}", e)))
    }
}

/// Drop caller credentials from a query string before it leaves the process.
fn strip_signature_params(query: &str) -> String {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    let kept: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(name, _)| name != SIGNATURE_PARAM && name != EXPIRE_PARAM)
        .collect();
    serde_urlencoded::to_string(kept).unwrap_or_default()
}
