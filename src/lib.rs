//! Out-of-band interaction server.
//!
//! A public endpoint that accepts traffic on several application protocols,
//! attributes each request to a registered client by recognising a
//! client-specific token embedded in the request, stores the request
//! encrypted, and lets the owning client poll for its accumulated
//! interactions.
//!
//! ```text
//! DNS / SMTP / HTTP data plane ──► CaptureSink ──► InteractionStorage
//!                                                        ▲
//! HTTP control plane ── /register /poll /deregister ─────┘
//! ```

pub mod capture;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod error;
pub mod interaction;
pub mod metrics;
pub mod server;
pub mod storage;
