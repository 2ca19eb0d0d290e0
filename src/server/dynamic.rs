//! Dynamic HTTP behaviour: client-shaped responses and operator-published
//! canned endpoints.
//!
//! The response engine lets a test fake status, headers, latency and body on
//! the data plane through query parameters. The endpoint registry serves
//! operator-published bodies below `/apidocs/` with a 24 hour update
//! cool-down per suburl.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Upper bound on the client-requested delay, so a hostile `delay` cannot
/// pin handler tasks indefinitely.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

const B64_BODY_PREFIX: &str = "/b64_body:";

/// Parameters recognised on a dynamic request, in evaluation order.
#[derive(Debug, Default, PartialEq)]
pub struct DynamicParams {
    /// Decoded `/b64_body:<b64>/` path segment, evaluated first.
    pub path_body: Option<Vec<u8>>,
    /// Every `header=K:V` pair, malformed entries already dropped.
    pub headers: Vec<(String, String)>,
    pub delay: Option<Duration>,
    pub status: Option<u16>,
    pub body: Option<String>,
    /// Decoded `b64_body=<b64>` value, appended last.
    pub b64_body: Option<Vec<u8>>,
}

impl DynamicParams {
    pub fn from_uri(uri: &Uri) -> Self {
        let pairs: Vec<(String, String)> =
            url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();

        let headers = pairs
            .iter()
            .filter(|(k, _)| k == "header")
            .filter_map(|(_, v)| {
                v.split_once(':')
                    .map(|(name, value)| (name.to_string(), value.to_string()))
            })
            .collect();

        Self {
            path_body: decode_path_body(uri.path()),
            headers,
            delay: first(&pairs, "delay")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
            status: first(&pairs, "status").and_then(|v| v.parse().ok()),
            body: first(&pairs, "body").map(str::to_string),
            b64_body: first(&pairs, "b64_body").and_then(|v| BASE64.decode(v).ok()),
        }
    }

    /// Honor the `delay` parameter, clamped to [`MAX_DELAY`].
    pub async fn sleep(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay.min(MAX_DELAY)).await;
        }
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status.and_then(|code| StatusCode::from_u16(code).ok())
    }
}

/// Build a response entirely from dynamic parameters: path body, then
/// headers, delay, status, body and base64 body, in that order.
pub async fn respond(uri: &Uri) -> Response {
    let params = DynamicParams::from_uri(uri);

    let mut body: Vec<u8> = Vec::new();
    if let Some(decoded) = &params.path_body {
        body.extend_from_slice(decoded);
    }
    let headers = params.header_map();
    params.sleep().await;
    let status = params.status_code().unwrap_or(StatusCode::OK);
    if let Some(text) = &params.body {
        body.extend_from_slice(text.as_bytes());
    }
    if let Some(decoded) = &params.b64_body {
        body.extend_from_slice(decoded);
    }

    (status, headers, Body::from(body)).into_response()
}

/// The base64 segment between the first `/b64_body:` and the last `/` of the
/// path. Requests without a closing slash or with undecodable content yield
/// nothing; the failure is intentionally silent.
fn decode_path_body(path: &str) -> Option<Vec<u8>> {
    let start = path.find(B64_BODY_PREFIX)? + B64_BODY_PREFIX.len();
    let end = path.rfind('/')?;
    if end <= start {
        return None;
    }
    BASE64.decode(&path[start..end]).ok()
}

fn first<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.as_str())
}

/// An operator-published canned response.
struct StoredEndpoint {
    body: Vec<u8>,
    content_type: String,
    last_updated: Instant,
}

/// How long a suburl is locked after an update.
const UPDATE_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The suburl was updated less than 24 hours ago.
    CoolingDown,
}

/// Registry behind `/storerequest` and `/apidocs/`. Writes are rare, so one
/// read-write lock over the whole map is enough.
#[derive(Default)]
pub struct DynamicEndpoints {
    inner: RwLock<HashMap<String, StoredEndpoint>>,
}

impl DynamicEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a suburl. The cool-down check and the write happen
    /// under one write lock, so two racing updates cannot both pass the check.
    pub fn store(&self, suburl: &str, body: Vec<u8>, content_type: String) -> StoreOutcome {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.get(suburl) {
            if existing.last_updated.elapsed() < UPDATE_COOLDOWN {
                return StoreOutcome::CoolingDown;
            }
        }
        inner.insert(
            suburl.to_string(),
            StoredEndpoint {
                body,
                content_type,
                last_updated: Instant::now(),
            },
        );
        StoreOutcome::Stored
    }

    pub fn get(&self, suburl: &str) -> Option<(Vec<u8>, String)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(suburl)
            .map(|endpoint| (endpoint.body.clone(), endpoint.content_type.clone()))
    }

    /// Age an entry as if it were updated `age` ago.
    #[cfg(test)]
    fn backdate(&self, suburl: &str, age: Duration) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(endpoint) = inner.get_mut(suburl) {
            if let Some(past) = Instant::now().checked_sub(age) {
                endpoint.last_updated = past;
            }
        }
    }
}
