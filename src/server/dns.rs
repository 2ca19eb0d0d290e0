//! Minimal DNS listener.
//!
//! Parses the first question of each UDP query, answers A queries with the
//! configured address (custom records win), and captures every query with
//! the lowercased name scanned for correlation tokens. Anything beyond that
//! — zone transfers, TCP fallback, EDNS — is out of scope for an
//! interaction catcher.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::capture::{Capture, CaptureSink};
use crate::error::ServerError;
use crate::interaction::Protocol;
use crate::metrics::Metrics;

const MAX_PACKET: usize = 4096;
const ANSWER_TTL: u32 = 3600;

pub struct DnsContext {
    pub sink: Arc<CaptureSink>,
    pub metrics: Arc<Metrics>,
    /// name → address overrides consulted before the default answer.
    pub records: HashMap<String, Ipv4Addr>,
    pub default_ip: Option<Ipv4Addr>,
}

pub async fn serve(
    socket: UdpSocket,
    ctx: Arc<DnsContext>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ServerError> {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = received.map_err(|source| ServerError::Listener {
            listener: "dns",
            source,
        })?;
        ctx.metrics.incr_dns();

        let Some(query) = Question::parse(&buf[..len]) else {
            tracing::debug!(%peer, "undecodable dns packet");
            continue;
        };
        tracing::debug!(%peer, name = query.name, q_type = query.type_name(), "dns query");

        let answer_ip = match query.qtype {
            TYPE_A | TYPE_ANY => ctx
                .records
                .get(&query.name)
                .copied()
                .or(ctx.default_ip),
            _ => None,
        };
        let response = query.build_response(&buf[..len], answer_ip);
        if let Err(err) = socket.send_to(&response, peer).await {
            tracing::warn!(%peer, %err, "could not send dns response");
        }

        let raw_request = format!(";; question\n{}. IN {}", query.name, query.type_name());
        let raw_response = match answer_ip {
            Some(ip) => format!(";; answer\n{}. {ANSWER_TTL} IN A {ip}", query.name),
            None => String::new(),
        };
        ctx.sink.submit(Capture {
            protocol: Protocol::Dns,
            raw_request: &raw_request,
            raw_response: &raw_response,
            remote_address: &peer.ip().to_string(),
            scan_text: &query.name,
            host: &query.name,
            q_type: Some(query.type_name()),
            smtp_from: "",
        });
    }
}

const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;

struct Question {
    name: String,
    qtype: u16,
    /// Byte offset one past the question section, for echoing it back.
    question_end: usize,
}

impl Question {
    /// Decode the header and first question. Compressed names never appear
    /// in well-formed questions and are rejected.
    fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 12 {
            return None;
        }
        let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
        if qdcount == 0 {
            return None;
        }
        let mut labels = Vec::new();
        let mut pos = 12;
        loop {
            let len = *packet.get(pos)? as usize;
            if len == 0 {
                pos += 1;
                break;
            }
            if len & 0xc0 != 0 {
                return None;
            }
            let label = packet.get(pos + 1..pos + 1 + len)?;
            labels.push(String::from_utf8_lossy(label).to_lowercase());
            pos += 1 + len;
        }
        let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
        Some(Self {
            name: labels.join("."),
            qtype,
            question_end: pos + 4,
        })
    }

    fn type_name(&self) -> &'static str {
        match self.qtype {
            TYPE_A => "A",
            2 => "NS",
            5 => "CNAME",
            6 => "SOA",
            12 => "PTR",
            15 => "MX",
            16 => "TXT",
            28 => "AAAA",
            TYPE_ANY => "ANY",
            _ => "OTHER",
        }
    }

    /// A NOERROR response echoing the question, with one A record when an
    /// address applies.
    fn build_response(&self, query: &[u8], answer_ip: Option<Ipv4Addr>) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.question_end + 16);
        out.extend_from_slice(&query[0..2]); // transaction id
        let rd = query[2] & 0x01;
        out.push(0x80 | rd); // QR=1, opcode QUERY, RD copied
        out.push(0x80); // RA=1, rcode NOERROR
        out.extend_from_slice(&[0, 1]); // qdcount
        out.extend_from_slice(&[0, u8::from(answer_ip.is_some())]); // ancount
        out.extend_from_slice(&[0, 0, 0, 0]); // nscount, arcount
        out.extend_from_slice(&query[12..self.question_end]);
        if let Some(ip) = answer_ip {
            out.extend_from_slice(&[0xc0, 0x0c]); // pointer to the question name
            out.extend_from_slice(&TYPE_A.to_be_bytes());
            out.extend_from_slice(&[0, 1]); // class IN
            out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
            out.extend_from_slice(&[0, 4]);
            out.extend_from_slice(&ip.octets());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut out = vec![0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&[0, 1]);
        out
    }

    #[test]
    fn parses_name_and_type() {
        let packet = encode_query("Probe.Example.COM", TYPE_A);
        let question = Question::parse(&packet).unwrap();
        assert_eq!(question.name, "probe.example.com");
        assert_eq!(question.qtype, TYPE_A);
        assert_eq!(question.type_name(), "A");
        assert_eq!(question.question_end, packet.len());
    }

    #[test]
    fn rejects_truncated_packets() {
        let packet = encode_query("probe.example.com", TYPE_A);
        assert!(Question::parse(&packet[..8]).is_none());
        assert!(Question::parse(&packet[..packet.len() - 3]).is_none());
    }

    #[test]
    fn answer_carries_the_address() {
        let packet = encode_query("probe.example.com", TYPE_A);
        let question = Question::parse(&packet).unwrap();
        let response = question.build_response(&packet, Some(Ipv4Addr::new(198, 51, 100, 7)));

        // same transaction id, response bit set, one answer
        assert_eq!(&response[0..2], &packet[0..2]);
        assert_eq!(response[2] & 0x80, 0x80);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
        assert_eq!(&response[response.len() - 4..], &[198, 51, 100, 7]);
    }

    #[test]
    fn unsupported_types_get_empty_noerror() {
        let packet = encode_query("probe.example.com", 16);
        let question = Question::parse(&packet).unwrap();
        let response = question.build_response(&packet, None);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
        assert_eq!(response[3] & 0x0f, 0); // NOERROR
    }
}
