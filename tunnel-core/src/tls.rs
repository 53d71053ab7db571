//! TLS material loading, autogeneration, and peer-certificate introspection.
//!
//! Kept deliberately separate from the pairing/forwarding engine: nothing in
//! `pipe`, `matcher`, or `pump` knows how a `rustls::ServerConfig` came to be,
//! only that it exists.

use crate::error::{CoreError, CoreResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a listener's TLS identity comes from. Mirrors the three ways the
/// configuration surface can supply TLS material (§4.1, §6).
#[derive(Debug, Clone)]
pub enum TlsMaterialSource {
    /// Synthesize a fresh self-signed keypair once at startup, reused for
    /// every accepted connection during the process lifetime.
    Autogenerate { common_name: String },
    /// Separate PEM-encoded private key and certificate files.
    KeyCert {
        key_path: PathBuf,
        cert_path: PathBuf,
    },
    /// A bundled PKCS#12 archive protected by a passphrase.
    Archive {
        pfx_path: PathBuf,
        passphrase: String,
    },
}

impl Default for TlsMaterialSource {
    fn default() -> Self {
        TlsMaterialSource::Autogenerate {
            common_name: "tunnel".to_string(),
        }
    }
}

/// Resolved configuration for building a listener-side `rustls::ServerConfig`.
#[derive(Debug, Clone, Default)]
pub struct ServerTlsConfig {
    pub material: TlsMaterialSource,
    pub request_client_cert: bool,
    pub ca_cert: Option<PathBuf>,
}

/// Resolved configuration for building an outbound `rustls::ClientConfig`,
/// used both by the agent dialing the relay and the agent dialing the
/// target service.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub verify_cert: bool,
    pub ca_cert: Option<PathBuf>,
    /// Optional client certificate presented during the handshake
    /// (`relayClientKey`/`relayClientCert`).
    pub client_identity: Option<(PathBuf, PathBuf)>,
}

fn tls_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> CoreError {
    let context = context.into();
    move |e| CoreError::TlsMaterialFailure(format!("{context}: {e}"))
}

fn read_certs(path: &Path) -> CoreResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(tls_err(format!("opening {}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_err(format!("parsing certificates in {}", path.display())))
}

fn read_private_key(path: &Path) -> CoreResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(tls_err(format!("opening {}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(tls_err(format!("parsing private key in {}", path.display())))?
        .ok_or_else(|| {
            CoreError::TlsMaterialFailure(format!("no private key found in {}", path.display()))
        })
}

fn read_pkcs12(path: &Path, passphrase: &str) -> CoreResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let der = std::fs::read(path).map_err(tls_err(format!("opening {}", path.display())))?;
    let pkcs12 = openssl::pkcs12::Pkcs12::from_der(&der)
        .map_err(|e| CoreError::TlsMaterialFailure(format!("{}: not a valid PKCS#12 archive: {e}", path.display())))?;
    let parsed = pkcs12
        .parse2(passphrase)
        .map_err(|e| CoreError::TlsMaterialFailure(format!("{}: wrong passphrase or corrupt archive: {e}", path.display())))?;
    let cert = parsed
        .cert
        .ok_or_else(|| CoreError::TlsMaterialFailure(format!("{}: archive has no certificate", path.display())))?;
    let pkey = parsed
        .pkey
        .ok_or_else(|| CoreError::TlsMaterialFailure(format!("{}: archive has no private key", path.display())))?;

    let mut chain = vec![CertificateDer::from(cert.to_der().map_err(|e| {
        CoreError::TlsMaterialFailure(format!("{}: re-encoding certificate: {e}", path.display()))
    })?)];
    if let Some(ca_chain) = parsed.ca {
        for ca in ca_chain {
            chain.push(CertificateDer::from(ca.to_der().map_err(|e| {
                CoreError::TlsMaterialFailure(format!("{}: re-encoding CA certificate: {e}", path.display()))
            })?));
        }
    }
    let key_der = pkey
        .private_key_to_pkcs8()
        .map_err(|e| CoreError::TlsMaterialFailure(format!("{}: re-encoding private key: {e}", path.display())))?;
    Ok((chain, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der))))
}

/// Generate a 7-day self-signed certificate carrying the given common name.
/// Called once at startup; the result is reused for every accept.
fn generate_self_signed(common_name: &str) -> CoreResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = rcgen::CertificateParams::default();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(7);

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| CoreError::TlsMaterialFailure(format!("generating autogenerated key pair: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CoreError::TlsMaterialFailure(format!("generating autogenerated certificate: {e}")))?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert_der], key_der))
}

fn load_material(source: &TlsMaterialSource) -> CoreResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    match source {
        TlsMaterialSource::Autogenerate { common_name } => generate_self_signed(common_name),
        TlsMaterialSource::KeyCert { key_path, cert_path } => {
            Ok((read_certs(cert_path)?, read_private_key(key_path)?))
        }
        TlsMaterialSource::Archive { pfx_path, passphrase } => read_pkcs12(pfx_path, passphrase),
    }
}

fn load_root_store(ca_path: &Path) -> CoreResult<RootCertStore> {
    let certs = read_certs(ca_path)?;
    let mut store = RootCertStore::empty();
    let (added, _rejected) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(CoreError::TlsMaterialFailure(format!(
            "{} did not contain any usable CA certificates",
            ca_path.display()
        )));
    }
    Ok(store)
}

/// Build the server-side TLS config for a listener. When `request_client_cert`
/// is set, `ca_cert` must be present: it is the trust anchor verified peer
/// certificates are checked against.
pub fn build_server_config(cfg: &ServerTlsConfig) -> CoreResult<Arc<ServerConfig>> {
    let (certs, key) = load_material(&cfg.material)?;

    let server_config = if cfg.request_client_cert {
        let ca_path = cfg.ca_cert.as_deref().ok_or_else(|| {
            CoreError::TlsMaterialFailure(
                "client certificate verification was requested but no CA certificate was configured".into(),
            )
        })?;
        let roots = load_root_store(ca_path)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| CoreError::TlsMaterialFailure(format!("building client certificate verifier: {e}")))?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
    }
    .map_err(|e| CoreError::TlsMaterialFailure(format!("building server TLS config: {e}")))?;

    Ok(Arc::new(server_config))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Only reachable when the operator has
    /// explicitly disabled verification (`targetVerifyCert=false` /
    /// `relayVerifyCert=false`); never the default.
    #[derive(Debug)]
    pub struct NoServerVerification;

    impl ServerCertVerifier for NoServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

/// Build an outbound TLS config, used by the agent to dial the relay and,
/// optionally, a TLS-speaking target service.
pub fn build_client_config(cfg: &ClientTlsConfig) -> CoreResult<Arc<ClientConfig>> {
    let builder = ClientConfig::builder();

    let client_config = if cfg.verify_cert {
        let ca_path = cfg.ca_cert.as_deref().ok_or_else(|| {
            CoreError::TlsMaterialFailure("certificate verification requested but no CA certificate was configured".into())
        })?;
        let roots = load_root_store(ca_path)?;
        let builder = builder.with_root_certificates(roots);
        match &cfg.client_identity {
            Some((key_path, cert_path)) => {
                let certs = read_certs(cert_path)?;
                let key = read_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| CoreError::TlsMaterialFailure(format!("building client TLS config: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    } else {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoServerVerification));
        match &cfg.client_identity {
            Some((key_path, cert_path)) => {
                let certs = read_certs(cert_path)?;
                let key = read_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| CoreError::TlsMaterialFailure(format!("building client TLS config: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    };

    Ok(Arc::new(client_config))
}

/// Extract the verified peer's common name from the leaf certificate of a
/// completed TLS handshake. Returns `None` when no client certificate was
/// presented or the subject has no CN attribute.
pub fn peer_common_name(leaf: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}
