//! Local certificate authority and on-demand leaf certificates
//!
//! The root is created once (or loaded from disk) and only ever used to
//! sign. Leaf certificates are issued the first time a hostname shows up in
//! a TLS handshake and cached until they expire.

use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca-key.pem";

const CA_COMMON_NAME: &str = "devgate local CA";
const CA_ORGANIZATION: &str = "devgate";
/// Backdate certificates to tolerate clock skew
const BACKDATE: Duration = Duration::from_secs(60 * 60);
/// Hostname used when a client sends no SNI
const DEFAULT_HOSTNAME: &str = "localhost";

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("invalid CA material: {0}")]
    InvalidCa(String),
    #[error("validity of {0:?} is out of range")]
    Validity(Duration),
    #[error("unusable signing key: {0}")]
    SigningKey(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Root key and certificate used to sign leaf certificates
pub struct CertificateAuthority {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    /// Issuer used for signing; its DER may differ from `cert_der` when loaded
    issuer: Certificate,
    key: KeyPair,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a fresh root valid for `validity`
    pub fn generate(validity: Duration) -> Result<Self, CertError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let params = ca_params(validity)?;
        let issuer = params.self_signed(&key)?;
        Ok(Self {
            cert_der: issuer.der().clone(),
            cert_pem: issuer.pem(),
            key_pem: key.serialize_pem(),
            issuer,
            key,
        })
    }

    /// Rebuild a root from its PEM certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let cert_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| CertError::InvalidCa("no certificate in PEM".to_string()))??;
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let issuer = params.self_signed(&key)?;

        if !same_public_key(&cert_der, &key)? {
            return Err(CertError::InvalidCa("key does not match certificate".to_string()));
        }

        Ok(Self {
            cert_der,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            issuer,
            key,
        })
    }

    /// Load `ca.pem`/`ca-key.pem` from `dir`, or generate and persist a new
    /// root if either is missing or the stored root has expired
    pub fn load_or_create(dir: &Path, validity: Duration) -> Result<Self, CertError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let ca = Self::from_pem(&cert_pem, &key_pem)?;
            if ca.expires_at()? > SystemTime::now() {
                info!(path = %cert_path.display(), "Loaded certificate authority");
                return Ok(ca);
            }
            warn!(path = %cert_path.display(), "Stored certificate authority expired, generating a new one");
        }

        let ca = Self::generate(validity)?;
        ca.save(dir)?;
        info!(path = %cert_path.display(), "Created certificate authority; trust it to avoid browser warnings");
        Ok(ca)
    }

    fn save(&self, dir: &Path) -> Result<(), CertError> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CA_CERT_FILE), &self.cert_pem)?;

        let key_path = dir.join(CA_KEY_FILE);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            // mode() only applies on creation
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            std::io::Write::write_all(&mut file, self.key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, &self.key_pem)?;
        }
        Ok(())
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Expiry of the root certificate
    pub fn expires_at(&self) -> Result<SystemTime, CertError> {
        let (_, cert) = x509_parser::parse_x509_certificate(self.cert_der.as_ref())
            .map_err(|e| CertError::InvalidCa(e.to_string()))?;
        let timestamp = cert.validity().not_after.timestamp();
        Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64))
    }

    /// Sign a certificate for `hostname` and `*.hostname`
    pub fn sign_leaf(&self, hostname: &str, validity: Duration) -> Result<LeafCertificate, CertError> {
        let mut params = CertificateParams::new(vec![hostname.to_string(), format!("*.{}", hostname)])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        (params.not_before, params.not_after) = validity_window(validity)?;
        let expires_at = SystemTime::now()
            .checked_add(validity)
            .ok_or(CertError::Validity(validity))?;

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.signed_by(&key, &self.issuer, &self.key)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)?;
        let chain = vec![cert.der().clone(), self.cert_der.clone()];

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            cert_der: cert.der().clone(),
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            expires_at,
        })
    }
}

/// Backdated start and end of a certificate valid for `validity` from now
fn validity_window(validity: Duration) -> Result<(time::OffsetDateTime, time::OffsetDateTime), CertError> {
    let now = time::OffsetDateTime::now_utc();
    let not_after = time::Duration::try_from(validity)
        .ok()
        .and_then(|v| now.checked_add(v))
        .ok_or(CertError::Validity(validity))?;
    Ok((now - BACKDATE, not_after))
}

fn ca_params(validity: Duration) -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    (params.not_before, params.not_after) = validity_window(validity)?;
    Ok(params)
}

fn same_public_key(cert_der: &CertificateDer<'_>, key: &KeyPair) -> Result<bool, CertError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(cert_der.as_ref()).map_err(|e| CertError::InvalidCa(e.to_string()))?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

/// An issued leaf certificate ready for use in a handshake
pub struct LeafCertificate {
    pub hostname: String,
    pub cert_der: CertificateDer<'static>,
    pub certified_key: Arc<CertifiedKey>,
    pub expires_at: SystemTime,
}

impl LeafCertificate {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// Supplies a certificate for a hostname during the TLS handshake
pub trait CertificateSource: Send + Sync {
    fn certificate_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>, CertError>;
}

type Slot = Arc<Mutex<Option<Arc<LeafCertificate>>>>;

/// Cache of leaf certificates keyed by hostname
pub struct CertStore {
    ca: Arc<CertificateAuthority>,
    leaf_validity: Duration,
    leaves: DashMap<String, Slot>,
    issued: AtomicU64,
}

impl CertStore {
    pub fn new(ca: Arc<CertificateAuthority>, leaf_validity: Duration) -> Self {
        Self {
            ca,
            leaf_validity,
            leaves: DashMap::new(),
            issued: AtomicU64::new(0),
        }
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Cached certificate for `hostname`, signing a new one on a miss or
    /// after expiry. Concurrent callers for one hostname sign once.
    pub fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>, CertError> {
        let hostname = normalize_hostname(hostname);
        let slot: Slot = self.leaves.entry(hostname.clone()).or_default().value().clone();

        // Only this hostname waits while signing
        let mut cached = slot.lock();
        if let Some(leaf) = cached.as_ref() {
            if !leaf.is_expired() {
                return Ok(Arc::clone(leaf));
            }
            debug!(hostname = %hostname, "Leaf certificate expired, reissuing");
        }

        let leaf = Arc::new(self.ca.sign_leaf(&hostname, self.leaf_validity)?);
        self.issued.fetch_add(1, Ordering::SeqCst);
        info!(hostname = %hostname, "Issued leaf certificate");
        *cached = Some(Arc::clone(&leaf));
        Ok(leaf)
    }

    /// Number of leaf certificates signed so far
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

impl CertificateSource for CertStore {
    fn certificate_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>, CertError> {
        Ok(Arc::clone(&self.issue_leaf(hostname)?.certified_key))
    }
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// SNI callback backed by a [`CertificateSource`]
pub struct SniResolver {
    source: Arc<dyn CertificateSource>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl SniResolver {
    pub fn new(source: Arc<dyn CertificateSource>) -> Self {
        Self { source }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello.server_name().unwrap_or(DEFAULT_HOSTNAME);
        match self.source.certificate_for(hostname) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(hostname, error = %e, "No certificate for handshake");
                None
            }
        }
    }
}

/// TLS acceptor that picks certificates by SNI
pub fn tls_acceptor(source: Arc<dyn CertificateSource>) -> TlsAcceptor {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(source)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}
