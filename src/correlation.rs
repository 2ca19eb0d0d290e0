//! Correlation token recognition.
//!
//! A token is a fixed-width lowercase alphanumeric string: a correlation id
//! prefix that identifies a registered client, followed by a per-subdomain
//! nonce. Tokens are recognised by sliding a window of the full token width
//! over lowercase-normalised chunks of text; the allocator is authoritative,
//! so a window only counts as a token when its id prefix is currently
//! registered.

use std::sync::Arc;

/// Read view over the set of currently registered correlation ids.
///
/// Implemented by the storage layer; the matcher never mutates it.
pub trait LiveIdView: Send + Sync {
    fn contains(&self, correlation_id: &str) -> bool;
}

/// A single token occurrence found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHit {
    /// The exact matched token, lowercase normalised.
    pub unique_id: String,
    /// The surrounding context: for URL scans, the dot-joined parts up to and
    /// including the matched one; for raw scans, the chunk containing the hit.
    pub full_id: String,
}

#[derive(Clone)]
pub struct TokenMatcher {
    id_length: usize,
    nonce_length: usize,
    ids: Arc<dyn LiveIdView>,
}

impl TokenMatcher {
    pub fn new(id_length: usize, nonce_length: usize, ids: Arc<dyn LiveIdView>) -> Self {
        Self {
            id_length,
            nonce_length,
            ids,
        }
    }

    /// Width of a full token: id prefix plus nonce.
    pub fn token_length(&self) -> usize {
        self.id_length + self.nonce_length
    }

    /// Length of the id prefix of a token.
    pub fn id_length(&self) -> usize {
        self.id_length
    }

    /// Whether `s` is a token of a currently registered client.
    pub fn is_correlation_id(&self, s: &str) -> bool {
        s.len() == self.token_length()
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && self.ids.contains(&s[..self.id_length])
    }

    /// Scan a request URL (`host` + path and query) for tokens.
    ///
    /// The URL is split on `.`, newline, tab and `/`; a window slides within
    /// each part. A hit in part `i` records the parts up to and including `i`,
    /// joined on `.`, as its `full_id` — that captures the whole subdomain a
    /// token was embedded in.
    pub fn find_in_url(&self, url: &str) -> Vec<TokenHit> {
        let parts: Vec<&str> = split_any(url, &['.', '\n', '\t', '/']);
        let mut hits = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let lowered = part.to_lowercase();
            for window in slide(&lowered, self.token_length()) {
                if self.is_correlation_id(window) {
                    hits.push(TokenHit {
                        unique_id: window.to_string(),
                        full_id: parts[..=i].join("."),
                    });
                }
            }
        }
        hits
    }

    /// Scan an entire raw request for tokens (scan-everywhere mode).
    ///
    /// The raw text is split on newline, tab, quotes and `/`; the chunk a
    /// token was found in becomes its `full_id`.
    pub fn find_everywhere(&self, raw: &str) -> Vec<TokenHit> {
        let chunks: Vec<&str> = split_any(raw, &['\n', '\t', '"', '\'', '/']);
        let mut hits = Vec::new();
        for chunk in chunks {
            let lowered = chunk.to_lowercase();
            for window in slide(&lowered, self.token_length()) {
                if self.is_correlation_id(window) {
                    hits.push(TokenHit {
                        unique_id: window.to_string(),
                        full_id: chunk.to_string(),
                    });
                }
            }
        }
        hits
    }

    /// The token embedded in a request host, if any.
    ///
    /// The trailing two labels (the registrable domain) are skipped. When
    /// several windows match, the last one wins.
    pub fn url_id_component(&self, host: &str) -> Option<String> {
        let parts: Vec<&str> = host.split('.').collect();
        let take = parts.len().saturating_sub(2);
        let mut found = None;
        for part in &parts[..take] {
            let lowered = part.to_lowercase();
            for window in slide(&lowered, self.token_length()) {
                if self.is_correlation_id(window) {
                    found = Some(window.to_string());
                }
            }
        }
        found
    }

    /// Character-reverse of the token embedded in `host`, echoed in default
    /// HTTP responses so an external test can observe its own marker.
    /// Empty when the host carries no registered token.
    pub fn url_reflection(&self, host: &str) -> String {
        self.url_id_component(host)
            .map(|token| token.chars().rev().collect())
            .unwrap_or_default()
    }
}

/// Split on any of `separators`, dropping empty parts.
fn split_any<'a>(text: &'a str, separators: &[char]) -> Vec<&'a str> {
    text.split(|c| separators.contains(&c))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Windows of `width` bytes over `s`; a string shorter than the window is
/// yielded whole, so short parts still get tested once.
fn slide(s: &str, width: usize) -> impl Iterator<Item = &str> {
    let len = s.len();
    let short = len < width;
    let range = if short { 0..1 } else { 0..len - width + 1 };
    range.filter_map(move |i| {
        if short {
            Some(s)
        } else if s.is_char_boundary(i) && s.is_char_boundary(i + width) {
            Some(&s[i..i + width])
        } else {
            None
        }
    })
}
