//! End-to-end tests for the HTTP planes.
//!
//! Each test binds a real server on a random port and talks to it with a
//! plain HTTP client, covering the registration/poll round trip, token
//! reflection on the data plane, dynamic responses and the operator
//! endpoints.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::watch;

use tattle::capture::CaptureSink;
use tattle::cli::Cli;
use tattle::config::Config;
use tattle::correlation::TokenMatcher;
use tattle::metrics::Metrics;
use tattle::server::dynamic::DynamicEndpoints;
use tattle::server::http::{build_router, serve, HttpState};
use tattle::storage::{InteractionStorage, MemoryStorage};

const ID: &str = "c6rj61aciaeutn2ae680";
const TOKEN: &str = "c6rj61aciaeutn2ae680cg5ugboyyyyyn";
const TOKEN_HOST: &str = "c6rj61aciaeutn2ae680cg5ugboyyyyyn.ugboyyyyyn.example.com";

fn keypair() -> &'static (RsaPrivateKey, String) {
    static KEYPAIR: OnceLock<(RsaPrivateKey, String)> = OnceLock::new();
    KEYPAIR.get_or_init(|| {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private_key, pem)
    })
}

struct TestServer {
    addr: SocketAddr,
    storage: Arc<dyn InteractionStorage>,
    _shutdown: watch::Sender<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Client resolving `host` to this server, so the Host header carries an
    /// arbitrary name.
    fn client_for(&self, host: &str) -> reqwest::Client {
        reqwest::Client::builder()
            .resolve(host, self.addr)
            .build()
            .unwrap()
    }
}

async fn spawn_server(extra_args: &[&str]) -> TestServer {
    let mut args = vec!["tattle", "--domain", "example.com"];
    args.extend_from_slice(extra_args);
    let config = Arc::new(Config::try_from(Cli::parse_from(args)).unwrap());

    let storage: Arc<dyn InteractionStorage> = Arc::new(MemoryStorage::new(
        config.ring_capacity,
        config.eviction_ttl,
    ));
    let matcher = TokenMatcher::new(
        config.correlation_id_length,
        config.correlation_id_nonce_length,
        storage.live_ids(),
    );
    let sink = Arc::new(CaptureSink::new(
        Arc::clone(&storage),
        matcher,
        config.domains.clone(),
        config.root_tld,
        config.scan_everywhere,
        config.token.clone(),
    ));
    let state = Arc::new(HttpState {
        config,
        storage: Arc::clone(&storage),
        sink,
        metrics: Arc::new(Metrics::new()),
        endpoints: Arc::new(DynamicEndpoints::new()),
    });
    let router = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        serve(listener, None, router, shutdown_rx).await.unwrap();
    });

    TestServer {
        addr,
        storage,
        _shutdown: shutdown_tx,
    }
}

async fn register(server: &TestServer, client: &reqwest::Client, secret: &str) {
    let (_, pem) = keypair();
    let response = client
        .post(server.url("/register"))
        .json(&json!({
            "public-key": pem,
            "secret-key": secret,
            "correlation-id": ID,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "registration successful");
}

fn decrypt(wrapped_key_b64: &str, sealed_b64: &str) -> Vec<u8> {
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};

    let (private_key, _) = keypair();
    let session_key = private_key
        .decrypt(
            Oaep::new::<Sha256>(),
            &BASE64.decode(wrapped_key_b64).unwrap(),
        )
        .unwrap();
    let framed = BASE64.decode(sealed_b64).unwrap();
    let (nonce, ciphertext) = framed.split_at(12);
    Aes256Gcm::new_from_slice(&session_key)
        .unwrap()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .unwrap()
}

#[tokio::test]
async fn register_then_empty_poll() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
    assert!(!body["aes_key"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn token_host_interaction_round_trip() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;

    let data_client = server.client_for(TOKEN_HOST);
    let response = data_client
        .get(format!("http://{TOKEN_HOST}:{}/probe", server.addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let reversed: String = TOKEN.chars().rev().collect();
    assert_eq!(
        response.text().await.unwrap(),
        format!("<html><head></head><body>{reversed}</body></html>")
    );

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);

    let plain = decrypt(
        body["aes_key"].as_str().unwrap(),
        data[0].as_str().unwrap(),
    );
    let interaction: Value = serde_json::from_slice(&plain).unwrap();
    assert_eq!(interaction["protocol"], "http");
    assert_eq!(interaction["unique-id"], TOKEN);
    assert_eq!(interaction["full-id"], TOKEN);
    assert!(interaction["raw-request"]
        .as_str()
        .unwrap()
        .contains("GET /probe"));
    assert!(!interaction["remote-address"].as_str().unwrap().is_empty());

    // the drain reset the buffer
    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn poll_with_wrong_secret_keeps_interactions() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;
    server
        .storage
        .add_interaction(ID, b"{\"protocol\":\"http\"}")
        .unwrap();

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=wrong")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("invalid secret"));

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn poll_requires_both_parameters() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();

    let response = client.get(server.url("/poll")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "no id specified for poll");

    let response = client
        .get(server.url("/poll?id=abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "no secret specified for poll");
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;

    let (_, pem) = keypair();
    let response = client
        .post(server.url("/register"))
        .json(&json!({
            "public-key": pem,
            "secret-key": "other",
            "correlation-id": ID,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn deregister_with_wrong_secret_keeps_pending() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;
    server
        .storage
        .add_interaction(ID, b"{\"protocol\":\"http\"}")
        .unwrap();

    let response = client
        .post(server.url("/deregister"))
        .json(&json!({ "correlation-id": ID, "secret-key": "wrong" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // and with the right secret the entry goes away
    let response = client
        .post(server.url("/deregister"))
        .json(&json!({ "correlation-id": ID, "secret-key": "s" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn store_request_and_apidocs_flow() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();

    let payload = json!({
        "body": "hello",
        "content_type": "text/plain",
        "suburl": "foo",
    });
    let response = client
        .post(server.url("/storerequest"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(server.url("/apidocs/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "hello");

    // a second update inside the cool-down is refused, the body stays
    let response = client
        .post(server.url("/storerequest"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let response = client
        .get(server.url("/apidocs/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "hello");

    // other suburls are unaffected
    let response = client
        .post(server.url("/storerequest"))
        .json(&json!({
            "body": "world",
            "content_type": "text/plain",
            "suburl": "bar",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(server.url("/apidocs/notfound"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(server.url("/storerequest"))
        .json(&json!({ "body": "x", "content_type": "y", "suburl": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn dynamic_response_shapes_status_and_body() {
    let server = spawn_server(&["--dynamic-resp"]).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/?status=500&body=err"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "err");

    let response = client
        .get(server.url("/?header=X-Probe:on&b64_body=aGk="))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-probe"].to_str().unwrap(), "on");
    assert_eq!(response.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn dynamic_delay_is_observable() {
    let server = spawn_server(&["--dynamic-resp"]).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let response = client
        .get(server.url("/?delay=1&body=x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "x");
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn dynamic_response_is_off_by_default() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/anything?status=500"))
        .send()
        .await
        .unwrap();
    // without --dynamic-resp the default reflection response answers
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn robots_txt_reflects_the_token() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;

    let data_client = server.client_for(TOKEN_HOST);
    let response = data_client
        .get(format!(
            "http://{TOKEN_HOST}:{}/robots.txt",
            server.addr.port()
        ))
        .send()
        .await
        .unwrap();
    let body = response.text().await.unwrap();
    assert!(body.starts_with("User-agent: *\nDisallow: / #"));
    let reversed: String = TOKEN.chars().rev().collect();
    assert!(body.ends_with(&reversed));
}

#[tokio::test]
async fn json_and_xml_paths_reflect() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;

    let data_client = server.client_for(TOKEN_HOST);
    let reversed: String = TOKEN.chars().rev().collect();

    let response = data_client
        .get(format!(
            "http://{TOKEN_HOST}:{}/payload.json",
            server.addr.port()
        ))
        .send()
        .await
        .unwrap();
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert_eq!(
        response.text().await.unwrap(),
        format!("{{\"data\":\"{reversed}\"}}")
    );

    let response = data_client
        .get(format!(
            "http://{TOKEN_HOST}:{}/payload.xml",
            server.addr.port()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.text().await.unwrap(),
        format!("<data>{reversed}</data>")
    );
}

#[tokio::test]
async fn banner_is_served_without_a_token() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();

    let response = client.get(server.url("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["server"].to_str().unwrap(),
        "example.com"
    );
    assert!(response.headers().contains_key("x-interactsh-version"));
    assert!(response.text().await.unwrap().contains("example.com"));
}

#[tokio::test]
async fn auth_gates_the_control_plane() {
    let server = spawn_server(&["--auth", "--token", "op-secret"]).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let (_, pem) = keypair();
    let response = client
        .post(server.url("/register"))
        .header("Authorization", "op-secret")
        .json(&json!({
            "public-key": pem,
            "secret-key": "s",
            "correlation-id": ID,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn root_tld_channel_reaches_pollers() {
    let server = spawn_server(&["--root-tld"]).await;
    let client = reqwest::Client::new();
    register(&server, &client, "s").await;

    let data_client = server.client_for("plain.example.com");
    data_client
        .get(format!(
            "http://plain.example.com:{}/hit",
            server.addr.port()
        ))
        .send()
        .await
        .unwrap();

    let response = client
        .get(server.url(&format!("/poll?id={ID}&secret=s")))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let tlddata = body["tlddata"].as_array().unwrap();
    assert_eq!(tlddata.len(), 1);
    let interaction: Value =
        serde_json::from_str(tlddata[0].as_str().unwrap()).unwrap();
    assert_eq!(interaction["full-id"], "plain.example.com");
}

#[tokio::test]
async fn cors_preflight_mirrors_configured_origin() {
    let server = spawn_server(&[]).await;
    let client = reqwest::Client::new();

    let response = client
        .request(reqwest::Method::OPTIONS, server.url("/poll"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert_eq!(
        response.headers()["access-control-allow-origin"]
            .to_str()
            .unwrap(),
        "*"
    );
    assert_eq!(
        response.headers()["access-control-allow-credentials"]
            .to_str()
            .unwrap(),
        "true"
    );
}
