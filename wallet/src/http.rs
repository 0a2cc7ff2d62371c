//! # HTTP Collaborator
//!
//! The wallet talks to exchanges through the [`HttpClient`] trait: a `GET`
//! and a JSON `POST`, both answering with a status and a JSON body. The
//! production implementation is [`ReqwestHttpClient`]; tests plug in an
//! in-process fake exchange instead.
//!
//! Exchange base URLs are canonicalized once (see [`canonicalize_base_url`])
//! and endpoint URLs are built with [`join_url`], so `https://ex.test` and
//! `https://ex.test/` name the same exchange.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::HTTP_TIMEOUT;
use crate::error::HttpError;

/// Status and decoded JSON body of an answered request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode a successful body into `T`; non-2xx answers become
    /// [`HttpError::Status`].
    pub fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        if !self.is_success() {
            return Err(HttpError::Status {
                url: self.url,
                status: self.status,
                body: self.body,
            });
        }
        serde_json::from_value(self.body).map_err(|e| HttpError::Decode {
            url: self.url,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<HttpResponse, HttpError>;
}

/// `POST` any serializable body.
pub async fn post<B: Serialize + ?Sized>(
    http: &dyn HttpClient,
    url: &str,
    body: &B,
) -> Result<HttpResponse, HttpError> {
    let body = serde_json::to_value(body).map_err(|e| HttpError::Decode {
        url: url.to_string(),
        reason: format!("cannot encode request: {}", e),
    })?;
    http.post_json(url, &body).await
}

// ---------------------------------------------------------------------------
// URLs
// ---------------------------------------------------------------------------

/// Normalize an exchange base URL: default to `https://`, drop query and
/// fragment, lowercase the host and end the path with `/`.
pub fn canonicalize_base_url(url: &str) -> String {
    let url = url.trim();
    let with_scheme = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    };
    let without_extras = with_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string();
    let (scheme, rest) = without_extras
        .split_once("://")
        .unwrap_or(("https", without_extras.as_str()));
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let mut out = format!("{}://{}{}", scheme, host.to_ascii_lowercase(), path);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Resolve `path` relative to a canonical base URL.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{}/{}", base, path)
}

// ---------------------------------------------------------------------------
// ReqwestHttpClient
// ---------------------------------------------------------------------------

/// [`HttpClient`] backed by `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("coffer-wallet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpError::Network {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn finish(url: &str, response: reqwest::Result<reqwest::Response>) -> Result<HttpResponse, HttpError> {
        let network = |e: reqwest::Error| HttpError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let response = response.map_err(network)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(network)?;
        // Error pages are often not JSON; keep them as a string.
        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        debug!(url, status, "exchange answered");
        Ok(HttpResponse {
            url: url.to_string(),
            status,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        let response = self.client.get(url).send().await;
        Self::finish(url, response).await
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<HttpResponse, HttpError> {
        let response = self.client.post(url).json(body).send().await;
        Self::finish(url, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_urls() {
        assert_eq!(canonicalize_base_url("exchange.test"), "https://exchange.test/");
        assert_eq!(canonicalize_base_url("http://Exchange.Test"), "http://exchange.test/");
        assert_eq!(
            canonicalize_base_url("https://ex.test/taler?x=1#frag"),
            "https://ex.test/taler/"
        );
        assert_eq!(canonicalize_base_url(" https://ex.test/ "), "https://ex.test/");
    }

    #[test]
    fn joins_paths() {
        assert_eq!(join_url("https://ex.test/", "keys"), "https://ex.test/keys");
        assert_eq!(
            join_url("https://ex.test/api/", "/reserve/status"),
            "https://ex.test/api/reserve/status"
        );
    }

    #[test]
    fn non_success_responses_become_status_errors() {
        let response = HttpResponse {
            url: "https://ex.test/keys".into(),
            status: 503,
            body: serde_json::json!({"hint": "maintenance"}),
        };
        match response.json::<serde_json::Value>() {
            Err(HttpError::Status { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body["hint"], "maintenance");
            }
            other => panic!("expected a status error, got {:?}", other),
        }
    }

    #[test]
    fn decode_failures_are_permanent() {
        let response = HttpResponse {
            url: "https://ex.test/keys".into(),
            status: 200,
            body: serde_json::json!({"unexpected": true}),
        };
        let err = response.json::<Vec<u32>>().unwrap_err();
        assert!(matches!(err, HttpError::Decode { .. }));
        assert!(!err.is_transient());
    }
}
