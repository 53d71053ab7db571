//! CLI flags, environment variables, and an optional YAML file merged into
//! the resolved [`AgentConfig`] the rest of the binary consumes. Mirrors the
//! relay's resolution order: defaults → config file → environment variable
//! → CLI flag.

use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tunnel_core::tls::ClientTlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_yaml::Error },
    #[error("{field} resolved to an invalid socket address: {source}")]
    InvalidAddr { field: &'static str, source: std::io::Error },
    #[error("{field} did not resolve to any socket address")]
    NoAddr { field: &'static str },
    #[error("relayClientKey and relayClientCert must both be set or both be omitted")]
    IncompleteClientIdentity,
    #[error("relayNumConn must be at least 1")]
    PoolSizeZero,
}

#[derive(Parser, Debug)]
#[command(name = "tunnel-agent", version, about = "Keeps a warm pool of outbound relay connections")]
pub struct Cli {
    #[arg(long, env = "TUNNEL_AGENT_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_AGENT_TARGET_HOST")]
    pub target_host: Option<String>,
    #[arg(long, env = "TUNNEL_AGENT_TARGET_PORT")]
    pub target_port: Option<u16>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_HOST")]
    pub relay_host: Option<String>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_PORT")]
    pub relay_port: Option<u16>,

    #[arg(long, env = "TUNNEL_AGENT_TARGET_TLS")]
    pub target_tls: Option<bool>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_TLS")]
    pub relay_tls: Option<bool>,
    #[arg(long, env = "TUNNEL_AGENT_TARGET_VERIFY_CERT")]
    pub target_verify_cert: Option<bool>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_VERIFY_CERT")]
    pub relay_verify_cert: Option<bool>,
    #[arg(long, env = "TUNNEL_AGENT_TARGET_CA_CERT")]
    pub target_ca_cert: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_CA_CERT")]
    pub relay_ca_cert: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_AGENT_RELAY_CLIENT_KEY")]
    pub relay_client_key: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_CLIENT_CERT")]
    pub relay_client_cert: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_AGENT_SECRET")]
    pub relay_secret: Option<String>,

    #[arg(long, env = "TUNNEL_AGENT_NUM_CONN")]
    pub relay_num_conn: Option<u32>,

    #[arg(long, env = "TUNNEL_AGENT_TARGET_TIMEOUT")]
    pub target_timeout: Option<u64>,
    #[arg(long, env = "TUNNEL_AGENT_RELAY_TIMEOUT")]
    pub relay_timeout: Option<u64>,

    #[arg(long, env = "TUNNEL_AGENT_SILENT")]
    pub silent: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    target_host: Option<String>,
    target_port: Option<u16>,
    relay_host: Option<String>,
    relay_port: Option<u16>,
    target_tls: Option<bool>,
    relay_tls: Option<bool>,
    target_verify_cert: Option<bool>,
    relay_verify_cert: Option<bool>,
    target_ca_cert: Option<PathBuf>,
    relay_ca_cert: Option<PathBuf>,
    relay_client_key: Option<PathBuf>,
    relay_client_cert: Option<PathBuf>,
    relay_secret: Option<String>,
    relay_num_conn: Option<u32>,
    target_timeout: Option<u64>,
    relay_timeout: Option<u64>,
    silent: Option<bool>,
}

/// Fully resolved configuration for the agent binary. Plain data: no `clap`
/// or `serde_yaml` types reach `tunnel-core`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub target_host: String,
    pub target_addr: SocketAddr,
    pub relay_host: String,
    pub relay_addr: SocketAddr,
    pub target_tls: Option<ClientTlsConfig>,
    pub relay_tls: Option<ClientTlsConfig>,
    pub relay_secret: Vec<u8>,
    pub pool_size: u32,
    pub target_timeout: Option<Duration>,
    pub relay_timeout: Option<Duration>,
    pub silent: bool,
}

pub fn load(cli: Cli) -> Result<AgentConfig, ConfigError> {
    let file = match &cli.config_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
                path: path.clone(),
                source,
            })?
        }
        None => FileConfig::default(),
    };

    let target_host = cli.target_host.or(file.target_host).unwrap_or_else(|| "127.0.0.1".to_string());
    let target_port = cli.target_port.or(file.target_port).unwrap_or(9000);
    let relay_host = cli.relay_host.or(file.relay_host).unwrap_or_else(|| "127.0.0.1".to_string());
    let relay_port = cli.relay_port.or(file.relay_port).unwrap_or(10080);

    let target_addr = resolve_addr("targetHost/targetPort", &target_host, target_port)?;
    let relay_addr = resolve_addr("relayHost/relayPort", &relay_host, relay_port)?;

    let client_key = cli.relay_client_key.or(file.relay_client_key);
    let client_cert = cli.relay_client_cert.or(file.relay_client_cert);
    let client_identity = match (client_key, client_cert) {
        (Some(key), Some(cert)) => Some((key, cert)),
        (None, None) => None,
        _ => return Err(ConfigError::IncompleteClientIdentity),
    };

    let target_tls_enabled = cli.target_tls.or(file.target_tls).unwrap_or(false);
    let relay_tls_enabled = cli.relay_tls.or(file.relay_tls).unwrap_or(false);

    let target_tls = target_tls_enabled.then(|| ClientTlsConfig {
        verify_cert: cli.target_verify_cert.or(file.target_verify_cert).unwrap_or(true),
        ca_cert: cli.target_ca_cert.clone().or(file.target_ca_cert.clone()),
        client_identity: None,
    });

    let relay_tls = relay_tls_enabled.then(|| ClientTlsConfig {
        verify_cert: cli.relay_verify_cert.or(file.relay_verify_cert).unwrap_or(true),
        ca_cert: cli.relay_ca_cert.clone().or(file.relay_ca_cert.clone()),
        client_identity: client_identity.clone(),
    });

    let relay_secret = cli.relay_secret.or(file.relay_secret).unwrap_or_default().into_bytes();
    let pool_size = cli.relay_num_conn.or(file.relay_num_conn).unwrap_or(1);
    if pool_size == 0 {
        return Err(ConfigError::PoolSizeZero);
    }

    let target_timeout = cli.target_timeout.or(file.target_timeout).filter(|ms| *ms > 0).map(Duration::from_millis);
    let relay_timeout = cli.relay_timeout.or(file.relay_timeout).filter(|ms| *ms > 0).map(Duration::from_millis);
    let silent = cli.silent.or(file.silent).unwrap_or(false);

    Ok(AgentConfig {
        target_host,
        target_addr,
        relay_host,
        relay_addr,
        target_tls,
        relay_tls,
        relay_secret,
        pool_size,
        target_timeout,
        relay_timeout,
        silent,
    })
}

fn resolve_addr(field: &'static str, host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| ConfigError::InvalidAddr { field, source })?
        .next()
        .ok_or(ConfigError::NoAddr { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            config_file: None,
            target_host: None,
            target_port: None,
            relay_host: None,
            relay_port: None,
            target_tls: None,
            relay_tls: None,
            target_verify_cert: None,
            relay_verify_cert: None,
            target_ca_cert: None,
            relay_ca_cert: None,
            relay_client_key: None,
            relay_client_cert: None,
            relay_secret: None,
            relay_num_conn: None,
            target_timeout: None,
            relay_timeout: None,
            silent: None,
        }
    }

    #[test]
    fn defaults_resolve_to_a_single_plain_connection() {
        let cfg = load(base_cli()).unwrap();
        assert_eq!(cfg.pool_size, 1);
        assert!(cfg.target_tls.is_none());
        assert!(cfg.relay_tls.is_none());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut cli = base_cli();
        cli.relay_num_conn = Some(0);
        assert!(matches!(load(cli), Err(ConfigError::PoolSizeZero)));
    }

    #[test]
    fn client_key_without_cert_is_rejected() {
        let mut cli = base_cli();
        cli.relay_client_key = Some(PathBuf::from("key.pem"));
        assert!(matches!(load(cli), Err(ConfigError::IncompleteClientIdentity)));
    }
}
