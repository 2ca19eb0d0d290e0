//! Command line surface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tattle")]
#[command(about = "Multi-protocol out-of-band interaction server")]
#[command(version)]
pub struct Cli {
    /// Domain to serve interactions for (repeatable)
    #[arg(short, long = "domain", required = true)]
    pub domain: Vec<String>,

    /// Public IP address answered for A queries
    #[arg(long, default_value = "")]
    pub ip_address: String,

    /// IP address to bind listeners on
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: String,

    #[arg(long, default_value_t = 53)]
    pub dns_port: u16,

    #[arg(long, default_value_t = 80)]
    pub http_port: u16,

    #[arg(long, default_value_t = 443)]
    pub https_port: u16,

    #[arg(long, default_value_t = 25)]
    pub smtp_port: u16,

    #[arg(long, default_value_t = 465)]
    pub smtps_port: u16,

    #[arg(long, default_value_t = 587)]
    pub smtp_autotls_port: u16,

    /// Reserved for an external SMB collaborator
    #[arg(long, default_value_t = 445)]
    pub smb_port: u16,

    /// Reserved for an external FTP collaborator
    #[arg(long, default_value_t = 21)]
    pub ftp_port: u16,

    /// Reserved for an external FTPS collaborator
    #[arg(long, default_value_t = 990)]
    pub ftps_port: u16,

    /// Reserved for an external LDAP collaborator
    #[arg(long, default_value_t = 389)]
    pub ldap_port: u16,

    /// Hostmaster email (repeatable)
    #[arg(long = "hostmaster")]
    pub hostmasters: Vec<String>,

    /// Require the operator token on control plane requests
    #[arg(long)]
    pub auth: bool,

    /// Operator token; generated at startup when --auth is set and this is empty
    #[arg(long, env = "TATTLE_TOKEN", default_value = "")]
    pub token: String,

    /// Origin allowed in CORS responses
    #[arg(long, default_value = "*")]
    pub origin_url: String,

    /// Header carrying the client IP behind a reverse proxy
    #[arg(long, default_value = "")]
    pub origin_ip_header: String,

    /// Mirror traffic against the bare domains into a shared channel
    #[arg(long)]
    pub root_tld: bool,

    /// Scan entire raw requests for tokens instead of just the URL
    #[arg(long)]
    pub scan_everywhere: bool,

    #[arg(long, default_value_t = 20)]
    pub correlation_id_length: usize,

    #[arg(long, default_value_t = 13)]
    pub correlation_id_nonce_length: usize,

    /// Custom banner file served at /, with {DOMAIN} substituted
    #[arg(long)]
    pub http_index: Option<PathBuf>,

    /// Directory served below /s/
    #[arg(long)]
    pub http_directory: Option<PathBuf>,

    /// Directory for an external FTP collaborator
    #[arg(long)]
    pub ftp_directory: Option<PathBuf>,

    /// File with custom DNS records, one "name ip" per line
    #[arg(long)]
    pub custom_records: Option<PathBuf>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    pub certificate_path: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    pub private_key_path: Option<PathBuf>,

    /// Honor status/delay/header/body query parameters on the data plane
    #[arg(long)]
    pub dynamic_resp: bool,

    /// Expose the /metrics endpoint
    #[arg(long)]
    pub enable_metrics: bool,

    /// Omit the version header from data plane responses
    #[arg(long)]
    pub no_version_header: bool,

    /// Fixed Server header value instead of the matched domain
    #[arg(long, default_value = "")]
    pub header_server: String,

    /// Journal interactions to disk in addition to memory
    #[arg(long)]
    pub disk_storage: bool,

    #[arg(long)]
    pub disk_storage_path: Option<PathBuf>,

    /// Seconds an idle registration lives before eviction
    #[arg(long, default_value_t = 3600)]
    pub eviction_ttl: u64,

    /// Interactions kept per client before the oldest is dropped
    #[arg(long, default_value_t = 5000)]
    pub ring_capacity: usize,
}
