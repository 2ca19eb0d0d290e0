//! HTTP front: control plane and data plane on one listener.
//!
//! The control plane (`/register`, `/deregister`, `/poll`, `/metrics`,
//! `/storerequest`, `/apidocs/`) is routed explicitly; everything else falls
//! through to the data-plane handler, which answers with token reflections
//! (or dynamic responses) and feeds the capture sink. TLS and plain traffic
//! share the same router; each accepted connection is served on its own task.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE, HOST, SERVER,
};
use axum::http::{request, HeaderMap, HeaderName, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::util::ServiceExt;
use tower_http::services::ServeDir;

use super::dynamic::{self, DynamicEndpoints, DynamicParams, StoreOutcome};
use crate::capture::{Capture, CaptureSink};
use crate::config::Config;
use crate::error::ServerError;
use crate::interaction::Protocol;
use crate::metrics::Metrics;
use crate::storage::InteractionStorage;

const VERSION_HEADER: &str = "x-interactsh-version";

const DEFAULT_BANNER: &str = "<h1> Tattle Server </h1>\n\n\
<b>Tattle</b> is an out-of-band interaction server: it records DNS lookups, \
HTTP callbacks and mail deliveries triggered by markers planted during \
security testing.<br><br>\n\n\
If you notice interactions from <b>*.{DOMAIN}</b> in your logs, someone \
(internal security engineers, pen-testers, bug-bounty hunters) has likely \
been testing an application of yours.<br><br>\n\n\
Investigate the sites those interactions originated from; if a vulnerability \
exists, examine the root cause and take the necessary steps to mitigate it.\n";

/// Peer address of the accepted connection, attached per connection in
/// [`serve`]. Absent when a reverse proxy strips it, hence the configurable
/// origin IP header.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

/// Shared state for both planes.
pub struct HttpState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn InteractionStorage>,
    pub sink: Arc<CaptureSink>,
    pub metrics: Arc<Metrics>,
    pub endpoints: Arc<DynamicEndpoints>,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    let mut control = Router::new()
        .route("/register", post(register_handler))
        .route("/deregister", post(deregister_handler))
        .route("/poll", get(poll_handler))
        .route("/storerequest", post(store_request_handler));
    if state.config.enable_metrics {
        control = control.route("/metrics", get(metrics_handler));
    }
    let control = control.route_layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        auth_middleware,
    ));

    Router::new()
        .merge(control)
        .route("/apidocs/{*suburl}", get(apidocs_handler))
        .fallback(data_plane_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            cors_middleware,
        ))
        .with_state(state)
}

/// Accept loop shared by the plain and TLS listeners. Each connection is
/// served on its own task with its peer address attached; the loop stops on
/// the shutdown signal while in-flight handlers drain on their own.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    router: Router,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ServerError> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = accepted.map_err(|source| ServerError::Listener {
            listener: if acceptor.is_some() { "https" } else { "http" },
            source,
        })?;
        let service = TowerToHyperService::new(router.clone().layer(Extension(PeerAddr(peer))));
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let served = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => {
                        auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(tls), service)
                            .await
                    }
                    Err(err) => {
                        tracing::debug!(%peer, %err, "tls handshake failed");
                        return;
                    }
                },
                None => {
                    auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                }
            };
            if let Err(err) = served {
                tracing::debug!(%peer, %err, "connection closed with error");
            }
        });
    }
}

// --- Middleware ---

async fn cors_middleware(
    State(state): State<Arc<HttpState>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut(), &state.config.origin_url);
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut(), &state.config.origin_url);
    response
}

fn apply_cors_headers(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

async fn auth_middleware(
    State(state): State<Arc<HttpState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.auth {
        return next.run(req).await;
    }
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if bool::from(
        presented
            .as_bytes()
            .ct_eq(state.config.token.as_bytes()),
    ) {
        next.run(req).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// --- Control plane ---

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "public-key", default)]
    public_key: String,
    #[serde(rename = "secret-key", default)]
    secret_key: String,
    #[serde(rename = "correlation-id", default)]
    correlation_id: String,
}

async fn register_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let request: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "could not decode register body");
            return json_error(
                &format!("could not decode json body: {err}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    state.metrics.incr_sessions();

    let correlation_id = request.correlation_id.to_lowercase();
    if let Err(err) = state.storage.register(
        &correlation_id,
        &request.secret_key,
        &request.public_key,
    ) {
        tracing::warn!(correlation_id, %err, "registration failed");
        return json_error(
            &format!("could not set id and public key: {err}"),
            StatusCode::BAD_REQUEST,
        );
    }
    tracing::debug!(correlation_id, "registered client");
    json_message("registration successful", StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct DeregisterRequest {
    #[serde(rename = "correlation-id", default)]
    correlation_id: String,
    #[serde(rename = "secret-key", default)]
    secret_key: String,
}

async fn deregister_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    // gauge of clients, not of records: dropped regardless of what storage says
    state.metrics.decr_sessions();

    let request: DeregisterRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "could not decode deregister body");
            return json_error(
                &format!("could not decode json body: {err}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let correlation_id = request.correlation_id.to_lowercase();
    if let Err(err) = state
        .storage
        .remove_id(&correlation_id, &request.secret_key)
    {
        tracing::warn!(correlation_id, %err, "deregistration failed");
        return json_error(
            &format!("could not remove id: {err}"),
            StatusCode::BAD_REQUEST,
        );
    }
    tracing::debug!(correlation_id, "deregistered client");
    json_message("deregistration successful", StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    id: Option<String>,
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    data: Vec<String>,
    extra: Vec<String>,
    aes_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tlddata: Option<Vec<String>>,
}

async fn poll_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<PollQuery>,
) -> Response {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return json_error("no id specified for poll", StatusCode::BAD_REQUEST);
    };
    let Some(secret) = query.secret.filter(|secret| !secret.is_empty()) else {
        return json_error("no secret specified for poll", StatusCode::BAD_REQUEST);
    };

    let correlation_id = id.to_lowercase();
    let drained = match state.storage.get_interactions(&correlation_id, &secret) {
        Ok(drained) => drained,
        Err(err) => {
            tracing::warn!(correlation_id, %err, "poll failed");
            return json_error(
                &format!("could not get interactions: {err}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    // the client is authenticated from here on, so the shared channels are
    // released alongside its own data
    let tlddata = if state.config.root_tld {
        let mut collected = Vec::new();
        for domain in &state.config.domains {
            collected.extend(
                state
                    .storage
                    .get_interactions_with_id(domain)
                    .unwrap_or_default(),
            );
        }
        Some(collected)
    } else {
        None
    };
    let extra = if state.config.token.is_empty() {
        Vec::new()
    } else {
        state
            .storage
            .get_interactions_with_id(&state.config.token)
            .unwrap_or_default()
    };

    tracing::debug!(
        correlation_id,
        interactions = drained.data.len(),
        "polled interactions"
    );
    axum::Json(PollResponse {
        data: drained.data,
        extra,
        aes_key: drained.aes_key,
        tlddata,
    })
    .into_response()
}

async fn metrics_handler(State(state): State<Arc<HttpState>>) -> Response {
    axum::Json(state.metrics.snapshot(state.storage.stats())).into_response()
}

#[derive(Debug, Deserialize)]
struct StoreRequest {
    #[serde(default)]
    body: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    suburl: String,
}

async fn store_request_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let request: StoreRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return json_error("invalid request", StatusCode::BAD_REQUEST),
    };
    if request.suburl.is_empty() {
        return json_error("invalid request", StatusCode::BAD_REQUEST);
    }
    match state.endpoints.store(
        &request.suburl,
        request.body.into_bytes(),
        request.content_type,
    ) {
        StoreOutcome::Stored => json_message("endpoint registered", StatusCode::OK),
        StoreOutcome::CoolingDown => json_error(
            "suburl can only be updated every 24 hours",
            StatusCode::TOO_MANY_REQUESTS,
        ),
    }
}

async fn apidocs_handler(
    State(state): State<Arc<HttpState>>,
    Path(suburl): Path<String>,
) -> Response {
    let Some((body, content_type)) = state.endpoints.get(&suburl) else {
        return json_error("not found", StatusCode::NOT_FOUND);
    };
    let mut response = (StatusCode::OK, Body::from(body)).into_response();
    if !content_type.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    response
}

// --- Data plane ---

async fn data_plane_handler(
    State(state): State<Arc<HttpState>>,
    peer: Option<Extension<PeerAddr>>,
    req: Request,
) -> Response {
    state.metrics.incr_http();

    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let host = request_host(&parts);
    let host_no_port = strip_port(&host);
    let raw_request = dump_request(&parts, &body_bytes);
    tracing::debug!(method = %parts.method, uri = %parts.uri, host, "data plane request");

    let mut response = route_data_plane(&state, &parts, host_no_port).await;

    let domain = server_domain(&state.config, host_no_port);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&domain) {
        headers.entry(SERVER).or_insert(value);
    }
    if !state.config.no_version_header {
        headers
            .entry(HeaderName::from_static(VERSION_HEADER))
            .or_insert(HeaderValue::from_static(env!("CARGO_PKG_VERSION")));
    }

    let (response, raw_response) = split_dump_response(response).await;

    let origin_ip = if state.config.origin_ip_header.is_empty() {
        None
    } else {
        parts
            .headers
            .get(state.config.origin_ip_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let remote_address = origin_ip
        .or_else(|| peer.map(|Extension(PeerAddr(addr))| addr.ip().to_string()))
        .unwrap_or_default();

    let url = format!(
        "{host}{}",
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    state.sink.submit(Capture {
        protocol: Protocol::Http,
        raw_request: &raw_request,
        raw_response: &raw_response,
        remote_address: &remote_address,
        scan_text: &url,
        host: host_no_port,
        q_type: None,
        smtp_from: "",
    });

    response
}

async fn route_data_plane(
    state: &Arc<HttpState>,
    parts: &request::Parts,
    host: &str,
) -> Response {
    let path = parts.uri.path();
    let query = parts.uri.query().unwrap_or("");
    let reflection = state.sink.matcher().url_reflection(host);

    if starts_with_ci(path, "/s/") && state.config.http_directory.is_some() {
        return serve_static(state, parts, state.config.dynamic_resp && !query.is_empty()).await;
    }
    if path == "/" && reflection.is_empty() {
        let template = state
            .config
            .custom_banner
            .as_deref()
            .unwrap_or(DEFAULT_BANNER);
        return Html(template.replace("{DOMAIN}", &server_domain(&state.config, host)))
            .into_response();
    }
    if path.eq_ignore_ascii_case("/robots.txt") {
        return format!("User-agent: *\nDisallow: / # {reflection}").into_response();
    }
    if ends_with_ci(path, ".json") {
        return (
            [(CONTENT_TYPE, "application/json")],
            format!("{{\"data\":\"{reflection}\"}}"),
        )
            .into_response();
    }
    if ends_with_ci(path, ".xml") {
        return (
            [(CONTENT_TYPE, "application/xml")],
            format!("<data>{reflection}</data>"),
        )
            .into_response();
    }
    if state.config.dynamic_resp && (!query.is_empty() || path.starts_with("/b64_body:")) {
        return dynamic::respond(&parts.uri).await;
    }
    Html(format!("<html><head></head><body>{reflection}</body></html>")).into_response()
}

/// Serve a file below the configured directory, with dynamic status, delay
/// and header parameters applied around it when requested. Directory
/// listings are refused.
async fn serve_static(
    state: &Arc<HttpState>,
    parts: &request::Parts,
    apply_dynamic: bool,
) -> Response {
    let path = parts.uri.path();
    if path.ends_with('/') {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(directory) = &state.config.http_directory else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let params = apply_dynamic.then(|| DynamicParams::from_uri(&parts.uri));
    if let Some(params) = &params {
        params.sleep().await;
    }

    let mut response = serve_file(directory, &path[2..]).await;

    if let Some(params) = &params {
        let extra = params.header_map();
        for (name, value) in extra.iter() {
            response.headers_mut().append(name.clone(), value.clone());
        }
        if let Some(status) = params.status_code() {
            *response.status_mut() = status;
        }
    }
    response
}

async fn serve_file(directory: &FsPath, rel_path: &str) -> Response {
    let uri: axum::http::Uri = match rel_path.parse() {
        Ok(uri) => uri,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let mut request = Request::new(Body::empty());
    *request.uri_mut() = uri;
    match ServeDir::new(directory)
        .append_index_html_on_directories(false)
        .oneshot(request)
        .await
    {
        Ok(response) => response.map(Body::new),
        Err(infallible) => match infallible {},
    }
}

// --- Helpers ---

fn json_body(key: &str, value: &str, status: StatusCode) -> Response {
    let mut response =
        (status, axum::Json(serde_json::json!({ key: value }))).into_response();
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response
}

fn json_error(message: &str, status: StatusCode) -> Response {
    json_body("error", message, status)
}

fn json_message(message: &str, status: StatusCode) -> Response {
    json_body("message", message, status)
}

/// The Server header value: the configured override, else the configured
/// domain the request host falls under, else the first configured domain.
fn server_domain(config: &Config, host: &str) -> String {
    if !config.header_server.is_empty() {
        return config.header_server.clone();
    }
    let host = host.to_lowercase();
    config
        .domains
        .iter()
        .find(|domain| host.ends_with(domain.as_str()))
        .unwrap_or(&config.domains[0])
        .clone()
}

fn request_host(parts: &request::Parts) -> String {
    parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .map(|(name, port)| {
            if port.bytes().all(|b| b.is_ascii_digit()) {
                name
            } else {
                host
            }
        })
        .unwrap_or(host)
}

fn starts_with_ci(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn ends_with_ci(text: &str, suffix: &str) -> bool {
    text.len() >= suffix.len() && text[text.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

fn dump_request(parts: &request::Parts, body: &[u8]) -> String {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} {:?}\r\n", parts.method, path_and_query, parts.version);
    for (name, value) in &parts.headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    out
}

/// Dump a response to text for capture, handing back an equivalent response
/// with the buffered body.
async fn split_dump_response(response: Response) -> (Response, String) {
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_else(|_| Bytes::new());
    let mut out = format!("{:?} {}\r\n", parts.version, parts.status);
    for (name, value) in &parts.headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(&bytes));
    (
        Response::from_parts(parts, Body::from(bytes)),
        out,
    )
}
