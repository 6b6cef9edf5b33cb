//! Per-request caching policy.
//!
//! Critical assets (markup, scripts, styles, manifest) are network-first so
//! an online client always runs the newest deployment. Everything else is
//! cache-first. Navigations resolve from the pre-warmed root document and
//! never end in an empty error page.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheManager, CacheRole, RequestKey};
use crate::error::{NetworkError, RouteError};
use crate::http::{Destination, Fetcher, Request, Response};

/// Served when a navigation has neither a cached document nor a network
const OFFLINE_DOCUMENT: &str = "<!DOCTYPE html>\n\
<html lang=\"en\">\n\
<head><meta charset=\"utf-8\"><meta name=\"viewport\" content=\"width=device-width, initial-scale=1\"><title>Offline</title></head>\n\
<body><h1>You are offline</h1><p>This page has not been saved for offline use yet. It will load once your connection returns.</p></body>\n\
</html>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not ours to handle: non-GET or cross-origin
    Passthrough,
    Navigation,
    NetworkFirst,
    CacheFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Synthesized offline response
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct Routed {
    pub response: Response,
    pub source: ResponseSource,
    pub strategy: Strategy,
}

impl Routed {
    fn new(response: Response, source: ResponseSource, strategy: Strategy) -> Self {
        Self {
            response,
            source,
            strategy,
        }
    }
}

/// Minimal HTML document served when a navigation cannot be satisfied
pub fn offline_document() -> Response {
    Response::ok(OFFLINE_DOCUMENT).with_header("content-type", "text/html; charset=utf-8")
}

/// Empty stand-in for a critical sub-resource that is unavailable
fn offline_placeholder() -> Response {
    Response::new(503, Vec::new()).with_header("content-type", "text/plain")
}

pub struct RequestRouter {
    caches: Arc<CacheManager>,
    fetcher: Arc<dyn Fetcher>,
    root_document: RequestKey,
    fetch_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        caches: Arc<CacheManager>,
        fetcher: Arc<dyn Fetcher>,
        root_document: &Url,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            caches,
            fetcher,
            root_document: RequestKey::get(root_document),
            fetch_timeout,
        }
    }

    pub fn classify(&self, request: &Request) -> Strategy {
        if request.method != Method::GET
            || request.url.origin() != self.caches.origin().origin()
        {
            return Strategy::Passthrough;
        }
        if request.is_navigation() {
            return Strategy::Navigation;
        }
        match request.destination {
            Destination::Document
            | Destination::Script
            | Destination::Style
            | Destination::Manifest => Strategy::NetworkFirst,
            _ => Strategy::CacheFirst,
        }
    }

    pub async fn route(&self, request: &Request) -> Result<Routed, RouteError> {
        let strategy = self.classify(request);
        debug!(url = %request.url, ?strategy, "Routing request");

        match strategy {
            Strategy::Passthrough => self.passthrough(request).await,
            Strategy::Navigation => Ok(self.navigation(request).await),
            Strategy::NetworkFirst => Ok(self.network_first(request).await),
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    pub async fn passthrough(&self, request: &Request) -> Result<Routed, RouteError> {
        self.fetcher
            .fetch(request)
            .await
            .map(|r| Routed::new(r, ResponseSource::Network, Strategy::Passthrough))
            .map_err(|source| RouteError::Unavailable {
                url: request.url.to_string(),
                source,
            })
    }

    async fn navigation(&self, request: &Request) -> Routed {
        let strategy = Strategy::Navigation;
        if let Some(doc) = self.root_document().await {
            return Routed::new(doc, ResponseSource::Cache, strategy);
        }

        match self.fetch_with_timeout(request).await {
            Ok(response) => Routed::new(response, ResponseSource::Network, strategy),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Navigation offline with no cached document");
                Routed::new(offline_document(), ResponseSource::Placeholder, strategy)
            }
        }
    }

    async fn network_first(&self, request: &Request) -> Routed {
        let strategy = Strategy::NetworkFirst;
        let key = RequestKey::get(&request.url);

        match self.fetch_with_timeout(request).await {
            Ok(response) => {
                self.write_through(&key, &response).await;
                Routed::new(response, ResponseSource::Network, strategy)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, falling back to cache");
                // Runtime copies are newer than pre-warmed ones
                let cached = match self.caches.lookup_in(CacheRole::Dynamic, &key).await {
                    Some(entry) => Some(entry),
                    None => self.caches.lookup_in(CacheRole::Static, &key).await,
                };
                if let Some(entry) = cached {
                    return Routed::new(entry.to_response(), ResponseSource::Cache, strategy);
                }

                if request.wants_document() {
                    if let Some(doc) = self.root_document().await {
                        return Routed::new(doc, ResponseSource::Cache, strategy);
                    }
                    return Routed::new(offline_document(), ResponseSource::Placeholder, strategy);
                }
                Routed::new(offline_placeholder(), ResponseSource::Placeholder, strategy)
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Routed, RouteError> {
        let strategy = Strategy::CacheFirst;
        let key = RequestKey::get(&request.url);

        if let Some(entry) = self.caches.lookup(&key).await {
            return Ok(Routed::new(entry.to_response(), ResponseSource::Cache, strategy));
        }

        match self.fetch_with_timeout(request).await {
            Ok(response) => {
                self.write_through(&key, &response).await;
                Ok(Routed::new(response, ResponseSource::Network, strategy))
            }
            Err(source) => {
                if request.wants_document() {
                    if let Some(doc) = self.root_document().await {
                        return Ok(Routed::new(doc, ResponseSource::Cache, strategy));
                    }
                }
                Err(RouteError::Unavailable {
                    url: request.url.to_string(),
                    source,
                })
            }
        }
    }

    async fn root_document(&self) -> Option<Response> {
        self.caches
            .lookup_in(CacheRole::Static, &self.root_document)
            .await
            .map(|e| e.to_response())
    }

    async fn fetch_with_timeout(&self, request: &Request) -> Result<Response, NetworkError> {
        match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(self.fetch_timeout)),
        }
    }

    async fn write_through(&self, key: &RequestKey, response: &Response) {
        if !response.is_cacheable() {
            debug!(key = %key, status = response.status, "Response not cacheable");
            return;
        }
        let entry = CacheEntry::from_response(key.clone(), response);
        if let Err(e) = self.caches.store(key.clone(), entry).await {
            warn!(key = %key, error = %e, "Failed to write response to cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::http::ResponseKind;
    use crate::test_support::ScriptedFetcher;

    const ORIGIN: &str = "https://app.test/";

    struct Harness {
        fetcher: Arc<ScriptedFetcher>,
        caches: Arc<CacheManager>,
        router: RequestRouter,
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    async fn harness(prewarm: &[(&str, &str)]) -> Harness {
        let fetcher = Arc::new(ScriptedFetcher::new());
        for (path, body) in prewarm {
            fetcher.respond(url(path).as_str(), Response::ok(*body));
        }
        let caches = Arc::new(CacheManager::new(
            "games",
            "v1",
            url("/"),
            Arc::new(CacheStorage::in_memory()),
            fetcher.clone(),
            Duration::from_secs(5),
        ));
        let assets: Vec<String> = prewarm.iter().map(|(p, _)| p.to_string()).collect();
        caches.install(&assets).await.unwrap();
        caches.activate().await.unwrap();

        let router = RequestRouter::new(
            caches.clone(),
            fetcher.clone(),
            &url("/"),
            Duration::from_millis(200),
        );
        Harness {
            fetcher,
            caches,
            router,
        }
    }

    #[tokio::test]
    async fn test_classify() {
        let h = harness(&[("/", "home")]).await;
        let r = &h.router;

        assert_eq!(r.classify(&Request::navigate(url("/play"))), Strategy::Navigation);
        assert_eq!(r.classify(&Request::get(url("/app.js"))), Strategy::NetworkFirst);
        assert_eq!(r.classify(&Request::get(url("/site.css"))), Strategy::NetworkFirst);
        assert_eq!(r.classify(&Request::get(url("/manifest.json"))), Strategy::NetworkFirst);
        assert_eq!(r.classify(&Request::get(url("/logo.png"))), Strategy::CacheFirst);
        assert_eq!(r.classify(&Request::get(url("/font.woff2"))), Strategy::CacheFirst);
        assert_eq!(
            r.classify(&Request::get(url("/save")).with_method(Method::POST)),
            Strategy::Passthrough
        );
        assert_eq!(
            r.classify(&Request::get(Url::parse("https://cdn.test/lib.js").unwrap())),
            Strategy::Passthrough
        );
    }

    #[tokio::test]
    async fn test_network_first_online_writes_through() {
        let h = harness(&[("/", "home")]).await;
        h.fetcher.respond(url("/app.js").as_str(), Response::ok("fresh js"));

        let routed = h.router.route(&Request::get(url("/app.js"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Network);
        assert_eq!(routed.response.body, b"fresh js");

        let cached = h
            .caches
            .lookup_in(CacheRole::Dynamic, &RequestKey::get(&url("/app.js")))
            .await
            .unwrap();
        assert_eq!(cached.payload, b"fresh js");
    }

    #[tokio::test]
    async fn test_network_first_offline_serves_prior_entry() {
        let h = harness(&[("/", "home"), ("/app.js", "old js")]).await;
        h.fetcher.respond(url("/app.js").as_str(), Response::ok("new js"));
        h.router.route(&Request::get(url("/app.js"))).await.unwrap();

        h.fetcher.set_offline(true);
        let routed = h.router.route(&Request::get(url("/app.js"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
        // The runtime copy wins over the pre-warmed one
        assert_eq!(routed.response.body, b"new js");
    }

    #[tokio::test]
    async fn test_network_first_offline_document_falls_back_to_root() {
        let h = harness(&[("/", "<html>home</html>")]).await;
        h.fetcher.set_offline(true);

        let routed = h.router.route(&Request::get(url("/rules.html"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
        assert_eq!(routed.response.body, b"<html>home</html>");
    }

    #[tokio::test]
    async fn test_network_first_offline_script_gets_placeholder() {
        let h = harness(&[("/", "home")]).await;
        h.fetcher.set_offline(true);

        let routed = h.router.route(&Request::get(url("/late.js"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Placeholder);
        assert_eq!(routed.response.status, 503);
    }

    #[tokio::test]
    async fn test_network_first_times_out_to_cache() {
        let h = harness(&[("/", "home"), ("/app.js", "cached js")]).await;
        h.fetcher.delay(url("/app.js").as_str(), Duration::from_secs(2));

        let routed = h.router.route(&Request::get(url("/app.js"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
        assert_eq!(routed.response.body, b"cached js");
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let h = harness(&[("/", "home"), ("/logo.png", "png")]).await;
        let before = h.fetcher.calls_to(url("/logo.png").as_str());

        let routed = h.router.route(&Request::get(url("/logo.png"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
        assert_eq!(routed.response.body, b"png");
        assert_eq!(h.fetcher.calls_to(url("/logo.png").as_str()), before);
    }

    #[tokio::test]
    async fn test_cache_first_miss_writes_through() {
        let h = harness(&[("/", "home")]).await;
        h.fetcher.respond(url("/sprite.png").as_str(), Response::ok("sprite"));

        let first = h.router.route(&Request::get(url("/sprite.png"))).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);

        h.fetcher.set_offline(true);
        let second = h.router.route(&Request::get(url("/sprite.png"))).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(h.fetcher.calls_to(url("/sprite.png").as_str()), 1);
    }

    #[tokio::test]
    async fn test_cache_first_miss_offline_propagates() {
        let h = harness(&[("/", "home")]).await;
        h.fetcher.set_offline(true);

        let err = h.router.route(&Request::get(url("/missing.png"))).await.unwrap_err();
        assert!(matches!(err, RouteError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_uncacheable_responses_not_stored() {
        let h = harness(&[("/", "home")]).await;
        h.fetcher.respond(url("/partial.mp3").as_str(), Response::new(206, "part"));
        h.fetcher.respond(url("/error.png").as_str(), Response::new(500, "boom"));
        let mut redirected = Response::ok("moved");
        redirected.redirected = true;
        h.fetcher.respond(url("/moved.png").as_str(), redirected);
        let mut opaque = Response::ok("opaque");
        opaque.kind = ResponseKind::Opaque;
        h.fetcher.respond(url("/opaque.png").as_str(), opaque);

        for path in ["/partial.mp3", "/error.png", "/moved.png", "/opaque.png"] {
            let routed = h.router.route(&Request::get(url(path))).await.unwrap();
            assert_eq!(routed.source, ResponseSource::Network);
            assert!(h.caches.lookup(&RequestKey::get(&url(path))).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_navigation_prefers_cached_root() {
        let h = harness(&[("/", "<html>cached</html>")]).await;
        h.fetcher.respond(url("/").as_str(), Response::ok("<html>live</html>"));
        let before = h.fetcher.total_calls();

        let routed = h.router.route(&Request::navigate(url("/"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Cache);
        assert_eq!(routed.response.body, b"<html>cached</html>");
        assert_eq!(h.fetcher.total_calls(), before);
    }

    #[tokio::test]
    async fn test_navigation_without_cache_or_network_gets_offline_document() {
        let h = harness(&[("/app.js", "js")]).await;
        h.fetcher.set_offline(true);

        let routed = h.router.route(&Request::navigate(url("/"))).await.unwrap();
        assert_eq!(routed.source, ResponseSource::Placeholder);
        let body = String::from_utf8(routed.response.body.clone()).unwrap();
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.contains("<title>Offline</title>"));
        assert!(body.trim_end().ends_with("</html>"));
        assert_eq!(
            routed.response.content_type(),
            Some("text/html; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn test_passthrough_not_cached() {
        let h = harness(&[("/", "home")]).await;
        h.fetcher.respond(url("/save").as_str(), Response::ok("saved"));

        let req = Request::get(url("/save")).with_method(Method::POST);
        let routed = h.router.route(&req).await.unwrap();
        assert_eq!(routed.strategy, Strategy::Passthrough);
        assert!(h.caches.lookup(&RequestKey::get(&url("/save"))).await.is_none());
    }
}
