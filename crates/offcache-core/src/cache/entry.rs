use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::http::{Request, Response, ResponseKind};
use crate::utils::format_age;

/// Normalized `"GET <url>"` key. Only GET requests can produce one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Key for a GET of `url`. Fragments never reach the server, so they are dropped.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        RequestKey(format!("{} {}", Method::GET, url))
    }

    pub fn for_request(request: &Request) -> Result<Self, CacheError> {
        if request.method != Method::GET {
            return Err(CacheError::NonGet(format!("{} {}", request.method, request.url)));
        }
        Ok(Self::get(&request.url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL part of the key
    pub fn url(&self) -> &str {
        self.0.split_once(' ').map(|(_, url)| url).unwrap_or(&self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMeta {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub request_key: RequestKey,
    pub stored_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub content_meta: ContentMeta,
}

impl CacheEntry {
    pub fn from_response(request_key: RequestKey, response: &Response) -> Self {
        Self {
            request_key,
            stored_at: Utc::now(),
            payload: response.body.clone(),
            content_meta: ContentMeta {
                status: response.status,
                headers: response.headers.clone(),
            },
        }
    }

    pub fn to_response(&self) -> Response {
        Response {
            status: self.content_meta.status,
            headers: self.content_meta.headers.clone(),
            body: self.payload.clone(),
            kind: ResponseKind::Basic,
            redirected: false,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.stored_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        format_age(self.age_minutes())
    }
}
