//! TLS identity bootstrap for the local gateway
//!
//! Every process start generates a fresh self-signed identity that is valid
//! for exactly one day and bound to loopback names only. The certificate is
//! written to disk as PEM for introspection; the listener always presents the
//! in-memory copy.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Default location of the persisted certificate, relative to the working directory.
pub const DEFAULT_CERTIFICATE_PATH: &str = "config/server.pem";

/// ALPN identifier advertised by the listener.
const ALPN_HTTP_1_1: &[u8] = b"http/1.1";

/// Errors that can occur while bootstrapping TLS
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to generate self-signed certificate: {0}")]
    CertGenerationFailed(String),

    #[error("Failed to build TLS config: {0}")]
    ConfigBuildError(String),

    #[error("Failed to create certificate directory {path}: {message}")]
    DirCreationError { path: String, message: String },

    #[error("Failed to write certificate file {path}: {message}")]
    CertWriteError { path: String, message: String },
}

/// A freshly generated, self-signed server identity.
pub struct CertificateIdentity {
    key_der: PrivatePkcs8KeyDer<'static>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    /// Start of the validity window, truncated to whole seconds.
    pub not_before: DateTime<Utc>,
    /// End of the validity window, always `not_before + 1 day`.
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("fingerprint", &self.fingerprint())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateIdentity {
    /// DER encoding of the certificate.
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM encoding of the certificate (no key material).
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// SHA-256 fingerprint, colon-separated uppercase hex.
    pub fn fingerprint(&self) -> String {
        compute_cert_fingerprint(&self.cert_der)
    }

    /// Build the rustls server configuration presenting this identity.
    ///
    /// Only `http/1.1` is negotiated; the gateway has no use for a
    /// multiplexed protocol.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        // Idempotent; an already installed provider is fine.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let key = PrivateKeyDer::Pkcs8(self.key_der.clone_key());
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], key)
            .map_err(|e| TlsError::ConfigBuildError(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_HTTP_1_1.to_vec()];

        Ok(Arc::new(config))
    }
}

/// Generate a new self-signed CA identity for the loopback listener.
///
/// The key is ECDSA P-256. The certificate carries the subject
/// `C=CH, O=Shift Cryptosecurity, OU=wallet-gateway`, SANs `localhost`,
/// `127.0.0.1` and `::1`, and is valid from now until exactly one day later.
pub fn generate_identity() -> Result<CertificateIdentity, TlsError> {
    let now = Utc::now();
    let not_before = DateTime::<Utc>::from_timestamp(now.timestamp(), 0)
        .ok_or_else(|| TlsError::CertGenerationFailed("clock out of range".to_string()))?;
    let not_after = not_before + Duration::days(1);

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| TlsError::CertGenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "CH");
    dn.push(DnType::OrganizationName, "Shift Cryptosecurity");
    dn.push(DnType::OrganizationalUnitName, "wallet-gateway");
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        SanType::DnsName(
            "localhost"
                .try_into()
                .map_err(|e: rcgen::Error| TlsError::CertGenerationFailed(e.to_string()))?,
        ),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    params.not_before = to_offset_date_time(not_before)?;
    params.not_after = to_offset_date_time(not_after)?;

    let key_pair =
        KeyPair::generate().map_err(|e| TlsError::CertGenerationFailed(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertGenerationFailed(e.to_string()))?;

    let identity = CertificateIdentity {
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        cert_der: cert.der().clone(),
        cert_pem: cert.pem(),
        not_before,
        not_after,
    };
    debug!(target: "tls", fingerprint = %identity.fingerprint(), "generated TLS identity");
    Ok(identity)
}

/// Write the certificate PEM to `path`, creating parent directories.
///
/// Only the certificate is written; the private key never leaves memory.
/// Callers treat failure as non-fatal.
pub fn persist_certificate(identity: &CertificateIdentity, path: &Path) -> Result<(), TlsError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| TlsError::DirCreationError {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
    }
    std::fs::write(path, identity.certificate_pem().as_bytes()).map_err(|e| {
        TlsError::CertWriteError {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    })?;
    info!(target: "tls", "wrote server certificate to {}", path.display());
    Ok(())
}

/// Compute the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint as a colon-separated hex string, e.g.
/// `AB:CD:EF:01:...`
pub fn compute_cert_fingerprint(cert_der: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der.as_ref());
    let hash = hasher.finalize();

    hash.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn to_offset_date_time(at: DateTime<Utc>) -> Result<time::OffsetDateTime, TlsError> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| TlsError::CertGenerationFailed(e.to_string()))
}
