//! Shared capture pipeline for protocol listeners.
//!
//! Every listener funnels through [`CaptureSink::submit`]: scan the request
//! for correlation tokens, append one serialised interaction per hit under
//! the token's id prefix, then apply the root-TLD and auth-token channel
//! rules. Appends for unregistered ids vanish silently — from the outside it
//! is not observable whether an id exists.

use std::sync::Arc;

use crate::correlation::{TokenHit, TokenMatcher};
use crate::interaction::{Interaction, Protocol};
use crate::storage::InteractionStorage;

/// One observed exchange, as a listener saw it on the wire.
pub struct Capture<'a> {
    pub protocol: Protocol,
    pub raw_request: &'a str,
    pub raw_response: &'a str,
    pub remote_address: &'a str,
    /// Text scanned in url-only mode: the request URL for HTTP, the query
    /// name for DNS, the recipient list for SMTP.
    pub scan_text: &'a str,
    /// Host the request was aimed at, for the root-TLD rule.
    pub host: &'a str,
    pub q_type: Option<&'a str>,
    pub smtp_from: &'a str,
}

pub struct CaptureSink {
    storage: Arc<dyn InteractionStorage>,
    matcher: TokenMatcher,
    domains: Vec<String>,
    root_tld: bool,
    scan_everywhere: bool,
    token: String,
}

impl CaptureSink {
    pub fn new(
        storage: Arc<dyn InteractionStorage>,
        matcher: TokenMatcher,
        domains: Vec<String>,
        root_tld: bool,
        scan_everywhere: bool,
        token: String,
    ) -> Self {
        Self {
            storage,
            matcher,
            domains,
            root_tld,
            scan_everywhere,
            token,
        }
    }

    pub fn matcher(&self) -> &TokenMatcher {
        &self.matcher
    }

    pub fn submit(&self, capture: Capture<'_>) {
        let hits = if self.scan_everywhere {
            self.matcher.find_everywhere(capture.raw_request)
        } else {
            self.matcher.find_in_url(capture.scan_text)
        };
        for hit in hits {
            self.store_hit(&capture, hit);
        }

        if self.root_tld {
            let host = capture.host.to_lowercase();
            for domain in &self.domains {
                if host.ends_with(domain.as_str()) {
                    let interaction = self
                        .base_interaction(&capture, host.clone(), host.clone());
                    self.store_channel(domain, &interaction);
                }
            }
        }

        if !self.token.is_empty() && capture.raw_request.contains(self.token.as_str()) {
            let interaction = self.base_interaction(
                &capture,
                self.token.clone(),
                capture.host.to_lowercase(),
            );
            self.store_channel(&self.token, &interaction);
        }
    }

    fn store_hit(&self, capture: &Capture<'_>, hit: TokenHit) {
        let correlation_id = hit.unique_id[..self.matcher.id_length()].to_string();
        let interaction = self.base_interaction(capture, hit.unique_id, hit.full_id);
        match interaction.encode() {
            Ok(blob) => {
                tracing::debug!(
                    protocol = capture.protocol.as_str(),
                    correlation_id,
                    full_id = interaction.full_id,
                    "captured interaction"
                );
                if let Err(err) = self.storage.add_interaction(&correlation_id, &blob) {
                    tracing::warn!(correlation_id, %err, "could not store interaction");
                }
            }
            Err(err) => tracing::warn!(%err, "could not encode interaction"),
        }
    }

    fn store_channel(&self, key: &str, interaction: &Interaction) {
        match interaction.encode() {
            Ok(blob) => {
                if let Err(err) = self.storage.add_interaction_with_id(key, &blob) {
                    tracing::warn!(key, %err, "could not store channel interaction");
                }
            }
            Err(err) => tracing::warn!(%err, "could not encode channel interaction"),
        }
    }

    fn base_interaction(
        &self,
        capture: &Capture<'_>,
        unique_id: String,
        full_id: String,
    ) -> Interaction {
        let mut interaction = Interaction::new(capture.protocol, unique_id, full_id)
            .with_exchange(capture.raw_request, capture.raw_response)
            .with_remote_address(capture.remote_address);
        if let Some(q_type) = capture.q_type {
            interaction = interaction.with_q_type(q_type);
        }
        if !capture.smtp_from.is_empty() {
            interaction = interaction.with_smtp_from(capture.smtp_from);
        }
        interaction
    }
}
