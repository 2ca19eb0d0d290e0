//! Server entry point: configuration, shared state, listeners, supervision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tattle::capture::CaptureSink;
use tattle::cli::Cli;
use tattle::config::Config;
use tattle::correlation::TokenMatcher;
use tattle::metrics::Metrics;
use tattle::server::dns::{self, DnsContext};
use tattle::server::http::{self, HttpState};
use tattle::server::smtp::{self, SmtpContext, SmtpMode};
use tattle::server::{load_tls_config, ListenerEvent};
use tattle::storage::{DiskStorage, InteractionStorage, MemoryStorage};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tattle=info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Arc::new(Config::try_from(cli)?);
    if config.token_generated {
        tracing::info!(token = config.token, "generated operator token");
    }

    let storage: Arc<dyn InteractionStorage> = if config.disk_storage {
        let path = config
            .disk_storage_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tattle"));
        tracing::info!(path = %path.display(), "journalling interactions to disk");
        Arc::new(
            DiskStorage::new(path, config.ring_capacity, config.eviction_ttl)
                .context("could not open disk storage")?,
        )
    } else {
        Arc::new(MemoryStorage::new(config.ring_capacity, config.eviction_ttl))
    };

    {
        let storage = Arc::clone(&storage);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = storage.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired entries");
                }
            }
        });
    }

    let metrics = Arc::new(Metrics::new());
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

    let tls_acceptor = config
        .tls_paths()
        .map(|(cert, key)| load_tls_config(cert, key))
        .transpose()?
        .map(|tls| TlsAcceptor::from(Arc::new(tls)));

    let state = Arc::new(HttpState {
        config: Arc::clone(&config),
        storage: Arc::clone(&storage),
        sink: Arc::clone(&sink),
        metrics: Arc::clone(&metrics),
        endpoints: Arc::new(tattle::server::dynamic::DynamicEndpoints::new()),
    });
    let router = http::build_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let (event_tx, mut event_rx) = mpsc::channel::<ListenerEvent>(8);

    // HTTP planes
    {
        let addr = SocketAddr::new(config.listen_ip, config.http_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind http on {addr}"))?;
        tracing::info!(%addr, "http listener bound");
        spawn_listener(
            "http",
            http::serve(listener, None, router.clone(), shutdown_rx.clone()),
            event_tx.clone(),
        );
    }
    if let Some(acceptor) = &tls_acceptor {
        let addr = SocketAddr::new(config.listen_ip, config.https_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind https on {addr}"))?;
        tracing::info!(%addr, "https listener bound");
        spawn_listener(
            "https",
            http::serve(
                listener,
                Some(acceptor.clone()),
                router.clone(),
                shutdown_rx.clone(),
            ),
            event_tx.clone(),
        );
    }

    // DNS
    {
        let addr = SocketAddr::new(config.listen_ip, config.dns_port);
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("could not bind dns on {addr}"))?;
        tracing::info!(%addr, "dns listener bound");
        let ctx = Arc::new(DnsContext {
            sink: Arc::clone(&sink),
            metrics: Arc::clone(&metrics),
            records: config.dns_records.clone(),
            default_ip: config.ip_address,
        });
        spawn_listener(
            "dns",
            dns::serve(socket, ctx, shutdown_rx.clone()),
            event_tx.clone(),
        );
    }

    // SMTP family
    let smtp_ctx = Arc::new(SmtpContext {
        sink: Arc::clone(&sink),
        metrics: Arc::clone(&metrics),
        domain: config.domains[0].clone(),
        tls: tls_acceptor.clone(),
    });
    {
        let addr = SocketAddr::new(config.listen_ip, config.smtp_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind smtp on {addr}"))?;
        tracing::info!(%addr, "smtp listener bound");
        spawn_listener(
            "smtp",
            smtp::serve(
                listener,
                Arc::clone(&smtp_ctx),
                SmtpMode::Plain,
                shutdown_rx.clone(),
            ),
            event_tx.clone(),
        );
    }
    {
        let addr = SocketAddr::new(config.listen_ip, config.smtp_autotls_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind smtp auto-tls on {addr}"))?;
        tracing::info!(%addr, "smtp auto-tls listener bound");
        spawn_listener(
            "smtp-autotls",
            smtp::serve(
                listener,
                Arc::clone(&smtp_ctx),
                SmtpMode::StartTls,
                shutdown_rx.clone(),
            ),
            event_tx.clone(),
        );
    }
    if tls_acceptor.is_some() {
        let addr = SocketAddr::new(config.listen_ip, config.smtps_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind smtps on {addr}"))?;
        tracing::info!(%addr, "smtps listener bound");
        spawn_listener(
            "smtps",
            smtp::serve(
                listener,
                Arc::clone(&smtp_ctx),
                SmtpMode::Tls,
                shutdown_rx.clone(),
            ),
            event_tx.clone(),
        );
    }

    tracing::info!(domains = ?config.domains, "serving interactions");

    // supervise: a dead listener is fatal, the process supervisor restarts us
    let exit = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break Ok(());
            }
            event = event_rx.recv() => match event {
                Some(ListenerEvent::Ready { listener }) => {
                    tracing::debug!(listener, "listener ready");
                }
                Some(ListenerEvent::Failed { listener, error }) => {
                    tracing::error!(listener, error, "listener failed");
                    break Err(anyhow::anyhow!("{listener} listener failed: {error}"));
                }
                None => break Ok(()),
            }
        }
    };

    let _ = shutdown_tx.send(());
    storage.flush().context("could not flush storage")?;
    exit
}

fn spawn_listener<F>(name: &'static str, serve: F, events: mpsc::Sender<ListenerEvent>)
where
    F: std::future::Future<Output = Result<(), tattle::error::ServerError>> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = events.send(ListenerEvent::Ready { listener: name }).await;
        if let Err(err) = serve.await {
            let _ = events
                .send(ListenerEvent::Failed {
                    listener: name,
                    error: err.to_string(),
                })
                .await;
        }
    });
}
