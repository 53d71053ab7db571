//! CLI flags, environment variables, and an optional YAML file merged into
//! the resolved [`RelayConfig`] the rest of the binary consumes.
//!
//! Resolution order, lowest to highest precedence: built-in defaults →
//! config file → environment variable → CLI flag. `clap`'s `env` attribute
//! already folds CLI and environment together per field, so the remaining
//! merge here is just "CLI/env value, else file value, else default".

use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tunnel_core::tls::TlsMaterialSource;

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
    #[error("{listener} TLS material is inconsistent: provide either a pfx archive, a key+cert pair, or neither (to autogenerate)")]
    InconsistentTlsMaterial { listener: &'static str },
    #[error("{listener} requires client certificate verification but no CA certificate was configured")]
    MissingCaCert { listener: &'static str },
}

#[derive(Parser, Debug)]
#[command(name = "tunnel-relay", version, about = "Pairs agent connections with public clients")]
pub struct Cli {
    #[arg(long, env = "TUNNEL_RELAY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_HOST")]
    pub public_host: Option<String>,
    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_PORT")]
    pub public_port: Option<u16>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_HOST")]
    pub relay_host: Option<String>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_PORT")]
    pub relay_port: Option<u16>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_TIMEOUT")]
    pub public_timeout: Option<u64>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_TIMEOUT")]
    pub relay_timeout: Option<u64>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_TLS")]
    pub public_tls: Option<bool>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_TLS")]
    pub relay_tls: Option<bool>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_PFX")]
    pub public_pfx: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_KEY")]
    pub public_key: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_CERT")]
    pub public_cert: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_PASSPHRASE")]
    pub public_passphrase: Option<String>,

    #[arg(long, env = "TUNNEL_RELAY_RELAY_PFX")]
    pub relay_pfx: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_KEY")]
    pub relay_key: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_CERT")]
    pub relay_cert: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_PASSPHRASE")]
    pub relay_passphrase: Option<String>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_CERT_CN")]
    pub public_cert_cn: Option<String>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_CERT_CN")]
    pub relay_cert_cn: Option<String>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_CA_CERT")]
    pub public_ca_cert: Option<PathBuf>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_CA_CERT")]
    pub relay_ca_cert: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_RELAY_PUBLIC_REQUEST_CERT")]
    pub public_request_cert: Option<bool>,
    #[arg(long, env = "TUNNEL_RELAY_RELAY_REQUEST_CERT")]
    pub relay_request_cert: Option<bool>,

    #[arg(long, env = "TUNNEL_RELAY_SECRET")]
    pub relay_secret: Option<String>,

    #[arg(long, env = "TUNNEL_RELAY_SILENT")]
    pub silent: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    public_host: Option<String>,
    public_port: Option<u16>,
    relay_host: Option<String>,
    relay_port: Option<u16>,
    public_timeout: Option<u64>,
    relay_timeout: Option<u64>,
    public_tls: Option<bool>,
    relay_tls: Option<bool>,
    public_pfx: Option<PathBuf>,
    public_key: Option<PathBuf>,
    public_cert: Option<PathBuf>,
    public_passphrase: Option<String>,
    relay_pfx: Option<PathBuf>,
    relay_key: Option<PathBuf>,
    relay_cert: Option<PathBuf>,
    relay_passphrase: Option<String>,
    public_cert_cn: Option<String>,
    relay_cert_cn: Option<String>,
    public_ca_cert: Option<PathBuf>,
    relay_ca_cert: Option<PathBuf>,
    public_request_cert: Option<bool>,
    relay_request_cert: Option<bool>,
    relay_secret: Option<String>,
    silent: Option<bool>,
}

/// Fully resolved configuration for the relay binary. Plain data: no `clap`
/// or `serde_yaml` types reach `tunnel-core`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub public_addr: SocketAddr,
    pub relay_addr: SocketAddr,
    pub public_timeout: Option<Duration>,
    pub relay_timeout: Option<Duration>,
    pub public_tls: Option<ListenerTlsConfig>,
    pub relay_tls: Option<ListenerTlsConfig>,
    pub relay_secret: Vec<u8>,
    pub silent: bool,
}

#[derive(Debug, Clone)]
pub struct ListenerTlsConfig {
    pub material: TlsMaterialSource,
    pub request_client_cert: bool,
    pub ca_cert: Option<PathBuf>,
}

pub fn load(cli: Cli) -> Result<RelayConfig, ConfigError> {
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

    let public_host = cli.public_host.or(file.public_host).unwrap_or_else(|| "0.0.0.0".to_string());
    let public_port = cli.public_port.or(file.public_port).unwrap_or(10081);
    let relay_host = cli.relay_host.or(file.relay_host).unwrap_or_else(|| "0.0.0.0".to_string());
    let relay_port = cli.relay_port.or(file.relay_port).unwrap_or(10080);

    let public_addr = resolve_addr("publicHost/publicPort", &public_host, public_port)?;
    let relay_addr = resolve_addr("relayHost/relayPort", &relay_host, relay_port)?;

    let public_timeout = cli.public_timeout.or(file.public_timeout).filter(|ms| *ms > 0).map(Duration::from_millis);
    let relay_timeout = cli.relay_timeout.or(file.relay_timeout).filter(|ms| *ms > 0).map(Duration::from_millis);

    let public_tls_enabled = cli.public_tls.or(file.public_tls).unwrap_or(false);
    let relay_tls_enabled = cli.relay_tls.or(file.relay_tls).unwrap_or(false);

    let public_tls = if public_tls_enabled {
        Some(resolve_listener_tls(
            "publicListener",
            cli.public_pfx.or(file.public_pfx),
            cli.public_passphrase.or(file.public_passphrase),
            cli.public_key.or(file.public_key),
            cli.public_cert.or(file.public_cert),
            cli.public_cert_cn.or(file.public_cert_cn).unwrap_or_else(|| "tunnel-relay-public".to_string()),
            cli.public_request_cert.or(file.public_request_cert).unwrap_or(false),
            cli.public_ca_cert.or(file.public_ca_cert),
        )?)
    } else {
        None
    };

    let relay_tls = if relay_tls_enabled {
        Some(resolve_listener_tls(
            "relayListener",
            cli.relay_pfx.or(file.relay_pfx),
            cli.relay_passphrase.or(file.relay_passphrase),
            cli.relay_key.or(file.relay_key),
            cli.relay_cert.or(file.relay_cert),
            cli.relay_cert_cn.or(file.relay_cert_cn).unwrap_or_else(|| "tunnel-relay-agent".to_string()),
            cli.relay_request_cert.or(file.relay_request_cert).unwrap_or(false),
            cli.relay_ca_cert.or(file.relay_ca_cert),
        )?)
    } else {
        None
    };

    let relay_secret = cli.relay_secret.or(file.relay_secret).unwrap_or_default().into_bytes();
    let silent = cli.silent.or(file.silent).unwrap_or(false);

    Ok(RelayConfig {
        public_addr,
        relay_addr,
        public_timeout,
        relay_timeout,
        public_tls,
        relay_tls,
        relay_secret,
        silent,
    })
}

#[allow(clippy::too_many_arguments)]
fn resolve_listener_tls(
    listener: &'static str,
    pfx: Option<PathBuf>,
    passphrase: Option<String>,
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    common_name: String,
    request_client_cert: bool,
    ca_cert: Option<PathBuf>,
) -> Result<ListenerTlsConfig, ConfigError> {
    let material = match (pfx, key, cert) {
        (Some(pfx_path), None, None) => TlsMaterialSource::Archive {
            pfx_path,
            passphrase: passphrase.unwrap_or_default(),
        },
        (None, Some(key_path), Some(cert_path)) => TlsMaterialSource::KeyCert { key_path, cert_path },
        (None, None, None) => TlsMaterialSource::Autogenerate { common_name },
        _ => return Err(ConfigError::InconsistentTlsMaterial { listener }),
    };

    if request_client_cert && ca_cert.is_none() {
        return Err(ConfigError::MissingCaCert { listener });
    }

    Ok(ListenerTlsConfig {
        material,
        request_client_cert,
        ca_cert,
    })
}

fn resolve_addr(field: &'static str, host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| ConfigError::InvalidAddr { field, source })?
        .next()
        .ok_or(ConfigError::NoAddr { field })
}
