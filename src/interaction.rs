//! The interaction record shared by every protocol listener.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol a listener captured an interaction on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Dns,
    Smtp,
    Ftp,
    Smb,
    Ldap,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Dns => "dns",
            Protocol::Smtp => "smtp",
            Protocol::Ftp => "ftp",
            Protocol::Smb => "smb",
            Protocol::Ldap => "ldap",
        }
    }
}

/// One captured interaction, serialised as minified JSON before storage.
///
/// Field names are part of the wire format: polling clients decrypt and
/// decode these records directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub protocol: String,
    /// The exact recognised token instance.
    #[serde(rename = "unique-id")]
    pub unique_id: String,
    /// The surrounding hostname or chunk composed up to and including the token.
    #[serde(rename = "full-id")]
    pub full_id: String,
    /// DNS question type, set only by the DNS listener.
    #[serde(rename = "q-type", skip_serializing_if = "Option::is_none", default)]
    pub q_type: Option<String>,
    #[serde(rename = "raw-request", skip_serializing_if = "String::is_empty", default)]
    pub raw_request: String,
    #[serde(rename = "raw-response", skip_serializing_if = "String::is_empty", default)]
    pub raw_response: String,
    /// Sender from the SMTP `MAIL FROM` phase, set only by the SMTP listener.
    #[serde(rename = "smtp-from", skip_serializing_if = "String::is_empty", default)]
    pub smtp_from: String,
    #[serde(rename = "remote-address")]
    pub remote_address: String,
    pub timestamp: DateTime<Utc>,
    /// ASN enrichment, populated by an external pipeline when present.
    #[serde(rename = "asninfo", skip_serializing_if = "Option::is_none", default)]
    pub asn_info: Option<Vec<HashMap<String, String>>>,
}

impl Interaction {
    pub fn new(protocol: Protocol, unique_id: String, full_id: String) -> Self {
        Self {
            protocol: protocol.as_str().to_string(),
            unique_id,
            full_id,
            q_type: None,
            raw_request: String::new(),
            raw_response: String::new(),
            smtp_from: String::new(),
            remote_address: String::new(),
            timestamp: Utc::now(),
            asn_info: None,
        }
    }

    pub fn with_exchange(mut self, raw_request: &str, raw_response: &str) -> Self {
        self.raw_request = raw_request.to_string();
        self.raw_response = raw_response.to_string();
        self
    }

    pub fn with_remote_address(mut self, remote_address: &str) -> Self {
        self.remote_address = remote_address.to_string();
        self
    }

    pub fn with_q_type(mut self, q_type: &str) -> Self {
        self.q_type = Some(q_type.to_string());
        self
    }

    pub fn with_smtp_from(mut self, smtp_from: &str) -> Self {
        self.smtp_from = smtp_from.to_string();
        self
    }

    /// Minified JSON encoding used for storage and the unencrypted channels.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
