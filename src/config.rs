//! Runtime configuration, validated from the command line surface.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::cli::Cli;
use crate::error::ConfigError;

const GENERATED_TOKEN_LEN: usize = 32;

/// Validated server configuration. Built once in `main` and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    /// Configured domains, lowercase.
    pub domains: Vec<String>,
    /// Address answered for A queries, when set.
    pub ip_address: Option<Ipv4Addr>,
    pub listen_ip: IpAddr,
    pub dns_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    pub smtp_port: u16,
    pub smtps_port: u16,
    pub smtp_autotls_port: u16,
    pub smb_port: u16,
    pub ftp_port: u16,
    pub ftps_port: u16,
    pub ldap_port: u16,
    pub hostmasters: Vec<String>,
    pub auth: bool,
    pub token: String,
    /// Whether `token` was generated at startup rather than supplied.
    pub token_generated: bool,
    pub origin_url: String,
    pub origin_ip_header: String,
    pub root_tld: bool,
    pub scan_everywhere: bool,
    pub correlation_id_length: usize,
    pub correlation_id_nonce_length: usize,
    /// Contents of the custom banner file, `{DOMAIN}` not yet substituted.
    pub custom_banner: Option<String>,
    pub http_directory: Option<PathBuf>,
    pub ftp_directory: Option<PathBuf>,
    /// name → address overrides consulted before the default DNS answer.
    pub dns_records: HashMap<String, Ipv4Addr>,
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub dynamic_resp: bool,
    pub enable_metrics: bool,
    pub no_version_header: bool,
    pub header_server: String,
    pub disk_storage: bool,
    pub disk_storage_path: Option<PathBuf>,
    pub eviction_ttl: Duration,
    pub ring_capacity: usize,
}

impl Config {
    /// Certificate and key paths when TLS listeners are enabled.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.certificate_path, &self.private_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let domains: Vec<String> = cli
            .domain
            .iter()
            .map(|d| d.trim().trim_end_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }

        let listen_ip: IpAddr =
            cli.listen_ip
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "listen-ip".to_string(),
                    message: format!("not an IP address: {}", cli.listen_ip),
                })?;

        let ip_address = if cli.ip_address.is_empty() {
            None
        } else {
            Some(
                cli.ip_address
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "ip-address".to_string(),
                        message: format!("not an IPv4 address: {}", cli.ip_address),
                    })?,
            )
        };

        if cli.certificate_path.is_some() != cli.private_key_path.is_some() {
            return Err(ConfigError::IncompleteTls);
        }

        if cli.correlation_id_length == 0 || cli.correlation_id_nonce_length == 0 {
            return Err(ConfigError::InvalidValue {
                key: "correlation-id-length".to_string(),
                message: "token lengths must be positive".to_string(),
            });
        }

        let (token, token_generated) = if cli.auth && cli.token.is_empty() {
            (generate_token(), true)
        } else {
            (cli.token, false)
        };

        let custom_banner = cli
            .http_index
            .as_ref()
            .map(|path| {
                fs::read_to_string(path).map_err(|source| ConfigError::UnreadableFile {
                    path: path.clone(),
                    source,
                })
            })
            .transpose()?;

        let dns_records = cli
            .custom_records
            .as_ref()
            .map(|path| parse_records(path))
            .transpose()?
            .unwrap_or_default();

        Ok(Config {
            domains,
            ip_address,
            listen_ip,
            dns_port: cli.dns_port,
            http_port: cli.http_port,
            https_port: cli.https_port,
            smtp_port: cli.smtp_port,
            smtps_port: cli.smtps_port,
            smtp_autotls_port: cli.smtp_autotls_port,
            smb_port: cli.smb_port,
            ftp_port: cli.ftp_port,
            ftps_port: cli.ftps_port,
            ldap_port: cli.ldap_port,
            hostmasters: cli.hostmasters,
            auth: cli.auth,
            token,
            token_generated,
            origin_url: cli.origin_url,
            origin_ip_header: cli.origin_ip_header,
            root_tld: cli.root_tld,
            scan_everywhere: cli.scan_everywhere,
            correlation_id_length: cli.correlation_id_length,
            correlation_id_nonce_length: cli.correlation_id_nonce_length,
            custom_banner,
            http_directory: cli.http_directory,
            ftp_directory: cli.ftp_directory,
            dns_records,
            certificate_path: cli.certificate_path,
            private_key_path: cli.private_key_path,
            dynamic_resp: cli.dynamic_resp,
            enable_metrics: cli.enable_metrics,
            no_version_header: cli.no_version_header,
            header_server: cli.header_server,
            disk_storage: cli.disk_storage,
            disk_storage_path: cli.disk_storage_path,
            eviction_ttl: Duration::from_secs(cli.eviction_ttl),
            ring_capacity: cli.ring_capacity,
        })
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TOKEN_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Parse a records file: one `name ip` pair per line, `#` starts a comment.
fn parse_records(path: &PathBuf) -> Result<HashMap<String, Ipv4Addr>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::UnreadableFile {
        path: path.clone(),
        source,
    })?;
    let mut records = HashMap::new();
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (name, ip) = match (fields.next(), fields.next()) {
            (Some(name), Some(ip)) => (name, ip),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "custom-records".to_string(),
                    message: format!("malformed line: {line}"),
                })
            }
        };
        let ip: Ipv4Addr = ip.parse().map_err(|_| ConfigError::InvalidValue {
            key: "custom-records".to_string(),
            message: format!("not an IPv4 address: {ip}"),
        })?;
        records.insert(name.trim_end_matches('.').to_lowercase(), ip);
    }
    Ok(records)
}
