//! Minimal SMTP listener.
//!
//! Speaks just enough of the protocol to walk a sender through a delivery:
//! greeting, EHLO/HELO, MAIL FROM, RCPT TO, DATA, QUIT. Each completed (or
//! aborted) message is captured with the full client transcript; recipient
//! addresses are the scan surface for correlation tokens. A TLS-wrapped
//! variant runs on the SMTPS port and STARTTLS is offered on the auto-TLS
//! port when certificates are configured.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::capture::{Capture, CaptureSink};
use crate::error::ServerError;
use crate::interaction::Protocol;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpMode {
    Plain,
    /// TLS from the first byte (the SMTPS port).
    Tls,
    /// Plaintext with STARTTLS offered (the auto-TLS port).
    StartTls,
}

pub struct SmtpContext {
    pub sink: Arc<CaptureSink>,
    pub metrics: Arc<Metrics>,
    /// Domain announced in the greeting.
    pub domain: String,
    pub tls: Option<TlsAcceptor>,
}

pub async fn serve(
    listener: TcpListener,
    ctx: Arc<SmtpContext>,
    mode: SmtpMode,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ServerError> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = accepted.map_err(|source| ServerError::Listener {
            listener: "smtp",
            source,
        })?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            ctx.metrics.incr_smtp();
            if let Err(err) = handle_connection(stream, &ctx, mode).await {
                tracing::debug!(%peer, %err, "smtp session ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    ctx: &SmtpContext,
    mode: SmtpMode,
) -> std::io::Result<()> {
    let peer_ip = stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    match mode {
        SmtpMode::Plain => {
            run_session(stream, ctx, &peer_ip, false).await?;
        }
        SmtpMode::Tls => {
            let Some(acceptor) = &ctx.tls else {
                return Ok(());
            };
            let stream = acceptor.accept(stream).await?;
            run_session(stream, ctx, &peer_ip, false).await?;
        }
        SmtpMode::StartTls => {
            let offer_tls = ctx.tls.is_some();
            if let Some(stream) = run_session(stream, ctx, &peer_ip, offer_tls).await? {
                // compliant clients only send the handshake after our 220
                let Some(acceptor) = &ctx.tls else {
                    return Ok(());
                };
                let stream = acceptor.accept(stream).await?;
                run_session(stream, ctx, &peer_ip, false).await?;
            }
        }
    }
    Ok(())
}

/// Drive one SMTP dialogue. Returns the underlying stream when the client
/// asked to upgrade via STARTTLS.
async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    ctx: &SmtpContext,
    peer_ip: &str,
    allow_starttls: bool,
) -> std::io::Result<Option<S>> {
    let mut stream = BufStream::new(stream);
    let mut transcript = String::new();
    let mut replies = String::new();
    let mut from = String::new();
    let mut rcpts: Vec<String> = Vec::new();

    reply(
        &mut stream,
        &mut replies,
        &format!("220 {} ESMTP Service ready", ctx.domain),
    )
    .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            break;
        }
        transcript.push_str(&line);
        let trimmed = line.trim_end();
        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            if allow_starttls {
                reply(
                    &mut stream,
                    &mut replies,
                    &format!("250-{} greets you\r\n250 STARTTLS", ctx.domain),
                )
                .await?;
            } else {
                reply(
                    &mut stream,
                    &mut replies,
                    &format!("250 {} greets you", ctx.domain),
                )
                .await?;
            }
        } else if upper.starts_with("MAIL FROM:") {
            from = extract_address(trimmed);
            reply(&mut stream, &mut replies, "250 2.1.0 OK").await?;
        } else if upper.starts_with("RCPT TO:") {
            rcpts.push(extract_address(trimmed));
            reply(&mut stream, &mut replies, "250 2.1.5 OK").await?;
        } else if upper == "DATA" {
            reply(
                &mut stream,
                &mut replies,
                "354 End data with <CR><LF>.<CR><LF>",
            )
            .await?;
            loop {
                line.clear();
                if stream.read_line(&mut line).await? == 0 {
                    break;
                }
                transcript.push_str(&line);
                if line.trim_end() == "." {
                    break;
                }
            }
            reply(&mut stream, &mut replies, "250 2.0.0 OK: queued").await?;
            capture_message(ctx, &from, &rcpts, &transcript, &replies, peer_ip);
            from.clear();
            rcpts.clear();
        } else if upper == "STARTTLS" && allow_starttls {
            reply(&mut stream, &mut replies, "220 2.0.0 Ready to start TLS").await?;
            return Ok(Some(stream.into_inner()));
        } else if upper == "RSET" {
            from.clear();
            rcpts.clear();
            reply(&mut stream, &mut replies, "250 2.0.0 OK").await?;
        } else if upper == "NOOP" {
            reply(&mut stream, &mut replies, "250 2.0.0 OK").await?;
        } else if upper == "QUIT" {
            reply(&mut stream, &mut replies, "221 2.0.0 Bye").await?;
            break;
        } else {
            reply(&mut stream, &mut replies, "500 5.5.2 Command not recognized").await?;
        }
    }

    // a sender that hung up mid-message still leaked its recipients
    if !rcpts.is_empty() || !from.is_empty() {
        capture_message(ctx, &from, &rcpts, &transcript, &replies, peer_ip);
    }
    Ok(None)
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufStream<S>,
    replies: &mut String,
    text: &str,
) -> std::io::Result<()> {
    replies.push_str(text);
    replies.push_str("\r\n");
    stream.write_all(text.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

fn capture_message(
    ctx: &SmtpContext,
    from: &str,
    rcpts: &[String],
    transcript: &str,
    replies: &str,
    peer_ip: &str,
) {
    let scan_text = rcpts.join("\n");
    let host = rcpts
        .first()
        .and_then(|rcpt| rcpt.split_once('@'))
        .map(|(_, domain)| domain)
        .unwrap_or("");
    ctx.sink.submit(Capture {
        protocol: Protocol::Smtp,
        raw_request: transcript,
        raw_response: replies,
        remote_address: peer_ip,
        scan_text: &scan_text,
        host,
        q_type: None,
        smtp_from: from,
    });
}

/// The address inside `<...>`, or whatever follows the colon.
fn extract_address(line: &str) -> String {
    if let (Some(start), Some(end)) = (line.find('<'), line.rfind('>')) {
        if end > start {
            return line[start + 1..end].to_lowercase();
        }
    }
    line.split_once(':')
        .map(|(_, rest)| rest.trim().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_extraction_prefers_brackets() {
        assert_eq!(
            extract_address("MAIL FROM:<Probe@Example.com>"),
            "probe@example.com"
        );
        assert_eq!(
            extract_address("RCPT TO: token@oast.site"),
            "token@oast.site"
        );
        assert_eq!(extract_address("MAIL FROM"), "");
    }

    #[tokio::test]
    async fn session_walks_a_delivery_and_captures_recipients() {
        use crate::correlation::TokenMatcher;
        use crate::storage::{InteractionStorage, MemoryStorage};
        use crate::storage::testutil::test_keypair;

        const ID: &str = "c6rj61aciaeutn2ae680";
        const TOKEN: &str = "c6rj61aciaeutn2ae680cg5ugboyyyyyn";

        let (_, pem) = test_keypair();
        let storage = MemoryStorage::default();
        storage.register(ID, "secret", pem).unwrap();
        let shared: Arc<dyn InteractionStorage> = Arc::new(storage.clone());
        let matcher = TokenMatcher::new(20, 13, shared.live_ids());
        let ctx = Arc::new(SmtpContext {
            sink: Arc::new(CaptureSink::new(
                shared,
                matcher,
                vec!["example.com".to_string()],
                false,
                false,
                String::new(),
            )),
            metrics: Arc::new(Metrics::new()),
            domain: "example.com".to_string(),
            tls: None,
        });

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move { run_session(server, &ctx, "203.0.113.3", false).await }
        });

        let mut client = BufStream::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220"));

        for command in [
            "EHLO tester".to_string(),
            "MAIL FROM:<prober@attacker.test>".to_string(),
            format!("RCPT TO:<x@{TOKEN}.example.com>"),
            "DATA".to_string(),
        ] {
            client
                .write_all(format!("{command}\r\n").as_bytes())
                .await
                .unwrap();
            client.flush().await.unwrap();
            line.clear();
            client.read_line(&mut line).await.unwrap();
        }
        assert!(line.starts_with("354"));
        client.write_all(b"probe body\r\n.\r\nQUIT\r\n").await.unwrap();
        client.flush().await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("250"));
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("221"));

        drop(client);
        session.await.unwrap().unwrap();

        let drained = storage.get_interactions(ID, "secret").unwrap();
        assert_eq!(drained.data.len(), 1);
    }
}
