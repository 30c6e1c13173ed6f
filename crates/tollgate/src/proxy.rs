//! Request dispatch and forwarding.
//!
//! Every request is matched against the current service snapshot first
//! (host and path regexes, first match wins), then against the registered
//! local services in order, and finally falls through to the terminal
//! handler. Remote matches are reverse-proxied with the hop-by-hop headers
//! stripped in both directions.

use std::path::{Component, Path, PathBuf};

use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use async_trait::async_trait;

use l402::caveat::{Caveat, COND_PAYMENT_HASH};

use crate::error::ProxyError;
use crate::metrics;
use crate::services::Service;
use crate::state::AppState;

/// Headers scoped to a single connection; never forwarded in either
/// direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Request headers the proxy owns; stripped before adding our own values so
/// clients cannot spoof them.
const PROXY_OWNED_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-tollgate-verified",
    "x-tollgate-payment-hash",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// An in-process request handler with a match predicate. Local services are
/// consulted in registration order after no remote service matched.
#[async_trait(?Send)]
pub trait LocalHandler: Send + Sync {
    async fn handle(&self, req: &HttpRequest, body: web::Bytes) -> HttpResponse;
}

pub struct LocalService {
    name: &'static str,
    predicate: Box<dyn Fn(&HttpRequest) -> bool + Send + Sync>,
    handler: Box<dyn LocalHandler>,
}

impl LocalService {
    pub fn new(
        name: &'static str,
        predicate: impl Fn(&HttpRequest) -> bool + Send + Sync + 'static,
        handler: impl LocalHandler + 'static,
    ) -> Self {
        Self {
            name,
            predicate: Box::new(predicate),
            handler: Box::new(handler),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, req: &HttpRequest) -> bool {
        (self.predicate)(req)
    }

    pub async fn handle(&self, req: &HttpRequest, body: web::Bytes) -> HttpResponse {
        self.handler.handle(req, body).await
    }
}

/// The single entry point behind the HTTP server: dispatch, authenticate,
/// forward.
pub async fn dispatch(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let snapshot = state.registry.snapshot();
    let host = req.connection_info().host().to_string();

    if let Some(service) = snapshot.match_request(&host, req.path()) {
        let mut verified: Option<Vec<Caveat>> = None;
        if service.auth_required {
            let Some(authenticator) = &state.authenticator else {
                return ProxyError::Unavailable("authentication not configured".into())
                    .error_response();
            };
            match authenticator.authorize(&req, service).await {
                Ok(caveats) => verified = Some(caveats),
                Err(resp) => {
                    metrics::REQUESTS_TOTAL
                        .with_label_values(&[service.name.as_str(), resp.status().as_str()])
                        .inc();
                    return resp;
                }
            }
        }

        let timer = metrics::PROXY_LATENCY.start_timer();
        let resp = forward(&state.http_client, &req, body, service, verified.as_deref())
            .await
            .unwrap_or_else(|e| e.error_response());
        timer.observe_duration();
        metrics::REQUESTS_TOTAL
            .with_label_values(&[service.name.as_str(), resp.status().as_str()])
            .inc();
        return resp;
    }

    for local in state.local_services.iter() {
        if local.matches(&req) {
            tracing::debug!(service = local.name(), path = req.path(), "local dispatch");
            return local.handle(&req, body).await;
        }
    }

    ProxyError::NoRoute.error_response()
}

/// Reverse-proxy the request to the service backend and stream the answer
/// back unchanged. `verified` is the caveat set of an admitted token, passed
/// to the backend as request context.
pub async fn forward(
    client: &reqwest::Client,
    req: &HttpRequest,
    body: web::Bytes,
    service: &Service,
    verified: Option<&[Caveat]>,
) -> Result<HttpResponse, ProxyError> {
    let mut url = service.backend.clone();
    url.set_path(req.path());
    url.set_query(req.uri().query());

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| ProxyError::Backend("unsupported HTTP method".into()))?;

    let mut upstream = client.request(method, url).timeout(service.timeout);

    for (name, value) in req.headers() {
        let name = name.as_str();
        if is_hop_by_hop(name) || PROXY_OWNED_HEADERS.contains(&name) {
            continue;
        }
        upstream = upstream.header(name, value.as_bytes());
    }

    let forwarded_for = {
        let existing = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        let peer = req.peer_addr().map(|a| a.ip().to_string());
        match (existing, peer) {
            (Some(chain), Some(peer)) => Some(format!("{chain}, {peer}")),
            (None, Some(peer)) => Some(peer),
            (Some(chain), None) => Some(chain.to_string()),
            (None, None) => None,
        }
    };
    if let Some(chain) = forwarded_for {
        upstream = upstream.header("X-Forwarded-For", chain);
    }
    {
        let conn = req.connection_info();
        upstream = upstream
            .header("X-Forwarded-Host", conn.host())
            .header("X-Forwarded-Proto", conn.scheme());
    }

    if let Some(caveats) = verified {
        upstream = upstream.header("X-Tollgate-Verified", "true");
        if let Some(hash) = caveats.iter().find(|c| c.key == COND_PAYMENT_HASH) {
            upstream = upstream.header("X-Tollgate-Payment-Hash", hash.value.clone());
        }
    }

    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    let resp = upstream.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::BackendTimeout
        } else {
            ProxyError::Backend(e.to_string())
        }
    })?;

    let status = StatusCode::from_u16(resp.status().as_u16())
        .map_err(|_| ProxyError::Backend("invalid upstream status".into()))?;
    let mut out = HttpResponse::build(status);
    for (name, value) in resp.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_ref()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append_header((name, value));
        }
    }

    Ok(out.streaming(resp.bytes_stream()))
}

/// Serves the Prometheus text exposition on `/metrics`, optionally behind a
/// bearer token.
pub struct MetricsHandler {
    token: Option<String>,
}

impl MetricsHandler {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn matches(req: &HttpRequest) -> bool {
        req.path() == "/metrics"
    }
}

#[async_trait(?Send)]
impl LocalHandler for MetricsHandler {
    async fn handle(&self, req: &HttpRequest, _body: web::Bytes) -> HttpResponse {
        if let Some(expected) = &self.token {
            let presented = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented != Some(expected.as_str()) {
                return HttpResponse::Unauthorized().body("bearer token required\n");
            }
        }

        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = prometheus::Encoder::encode(
            &encoder,
            &metrics::REGISTRY.gather(),
            &mut buffer,
        ) {
            return ProxyError::Internal(format!("metrics encoding: {e}")).error_response();
        }
        HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(buffer)
    }
}

/// The terminal handler: plain 404 unless a static root is configured, in
/// which case unmatched requests are served from it.
pub struct TerminalHandler {
    static_root: Option<PathBuf>,
}

impl TerminalHandler {
    pub fn not_found() -> Self {
        Self { static_root: None }
    }

    pub fn static_files(root: impl Into<PathBuf>) -> Self {
        Self {
            static_root: Some(root.into()),
        }
    }
}

/// Map a request path to a file below the static root. Only plain path
/// components survive; anything else (traversal, absolute components)
/// yields `None`.
fn resolve_static_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let relative = if trimmed.is_empty() { "index.html" } else { trimmed };

    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            _ => return None,
        }
    }
    Some(resolved)
}

#[async_trait(?Send)]
impl LocalHandler for TerminalHandler {
    async fn handle(&self, req: &HttpRequest, _body: web::Bytes) -> HttpResponse {
        let Some(root) = &self.static_root else {
            return ProxyError::NoRoute.error_response();
        };

        let Some(path) = resolve_static_path(root, req.path()) else {
            return ProxyError::NoRoute.error_response();
        };
        match actix_files::NamedFile::open_async(path).await {
            Ok(file) => file.into_response(req),
            Err(_) => ProxyError::NoRoute.error_response(),
        }
    }
}
