//! Request and response types seen by the router, and the network seam.
//!
//! `Fetcher` is the only way the engine reaches the network. The production
//! implementation is `HttpFetcher` (reqwest); tests substitute a scripted one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NetworkError;

/// Upper bound on a single request made by `HttpFetcher`.
/// The router applies its own, shorter, fallback timeout on top of this.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level document load
    Navigate,
    SameOrigin,
    Cors,
    NoCors,
}

/// What the requested resource will be used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Document,
    Script,
    Style,
    Manifest,
    Image,
    Font,
    Audio,
    Video,
    Other,
}

impl Destination {
    /// Infer a destination from the URL path extension.
    /// Paths without an extension are treated as documents.
    pub fn infer(url: &Url) -> Self {
        let path = url.path();
        let last = path.rsplit('/').next().unwrap_or_default();
        if last.eq_ignore_ascii_case("manifest.json") {
            return Destination::Manifest;
        }
        let ext = match last.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Destination::Document,
        };

        match ext.as_str() {
            "html" | "htm" => Destination::Document,
            "js" | "mjs" => Destination::Script,
            "css" => Destination::Style,
            "webmanifest" => Destination::Manifest,
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif" => Destination::Image,
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Destination::Font,
            "mp3" | "wav" | "ogg" | "m4a" => Destination::Audio,
            "mp4" | "webm" => Destination::Video,
            _ => Destination::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub destination: Destination,
    pub headers: BTreeMap<String, String>,
}

impl Request {
    /// A same-origin GET with its destination inferred from the URL
    pub fn get(url: Url) -> Self {
        let destination = Destination::infer(&url);
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::SameOrigin,
            destination,
            headers: BTreeMap::new(),
        }
    }

    /// A top-level document load
    pub fn navigate(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::Navigate,
            destination: Destination::Document,
            headers: BTreeMap::new(),
        }
    }

    /// A navigation for document-like URLs, a plain GET otherwise
    pub fn infer(url: Url) -> Self {
        if Destination::infer(&url) == Destination::Document {
            Self::navigate(url)
        } else {
            Self::get(url)
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the request accepts an HTML document as its answer
    pub fn wants_document(&self) -> bool {
        self.is_navigation()
            || self.destination == Destination::Document
            || self
                .headers
                .get("accept")
                .map(|a| a.contains("text/html"))
                .unwrap_or(false)
    }
}

/// Mirrors the fetch response types that matter for caching decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Same-origin response
    Basic,
    /// Cross-origin response with CORS headers
    Cors,
    /// Cross-origin response whose contents are hidden
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub kind: ResponseKind,
    pub redirected: bool,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
            redirected: false,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Only complete, same-origin, non-redirected 200 responses are cached.
    /// Partial (206), redirected, opaque and error responses never are.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.kind == ResponseKind::Basic && !self.redirected
    }
}

/// The network. Implementations must not cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Fetcher backed by reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: Url,
}

impl HttpFetcher {
    pub fn new(origin: Url) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, origin })
    }

    fn response_kind(&self, url: &Url, headers: &header::HeaderMap) -> ResponseKind {
        if url.origin() == self.origin.origin() {
            ResponseKind::Basic
        } else if headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
            ResponseKind::Cors
        } else {
            ResponseKind::Opaque
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        let mut builder = self.client.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let kind = self.response_kind(&final_url, response.headers());

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await?.to_vec();
        debug!(url = %request.url, status, bytes = body.len(), "Network response received");

        Ok(Response {
            status,
            headers,
            body,
            kind,
            redirected: final_url != request.url,
        })
    }
}
