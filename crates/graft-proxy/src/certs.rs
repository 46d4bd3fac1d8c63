//! Per-domain leaf certificate store.
//!
//! Leaves are issued lazily, signed by the root CA, persisted as
//! `<domain>.crt` / `<domain>.key` PEM pairs and cached in memory. Callers
//! asking for the same domain at the same time are serialised on a per-domain
//! slot, so a domain never ends up with two live certificates.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{PrivateKeyDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use graft_core::normalize_host;

use crate::ca::{write_file, CaManager, RootAuthority};
use crate::error::CertIssuanceError;

/// Leaf validity window.
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Backdating applied to `not_before` to tolerate client clock skew.
const CLOCK_SKEW: Duration = Duration::seconds(60);

const MAX_DOMAIN_LEN: usize = 253;

type Slot = Arc<Mutex<Option<Arc<CertificateRecord>>>>;

/// An issued leaf certificate and its private key. Immutable once built.
pub struct CertificateRecord {
    domain: String,
    cert_pem: String,
    key_pem: String,
    public_key_der: Vec<u8>,
    certified_key: Arc<CertifiedKey>,
}

impl CertificateRecord {
    fn from_pem(domain: &str, cert_pem: String, key_pem: String) -> Result<Self, String> {
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| e.to_string())?;
        let certified_key = certified_key(&cert_pem, &key_pem)?;

        Ok(Self {
            domain: domain.to_string(),
            public_key_der: key_pair.subject_public_key_info(),
            cert_pem,
            key_pem,
            certified_key: Arc::new(certified_key),
        })
    }

    /// Domain (lowercase, no port) the certificate was issued for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// SubjectPublicKeyInfo of the leaf key, DER encoded.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// The pair in the form rustls serves.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// What a leaf is issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    Dns(String),
    Ip(IpAddr),
}

impl Subject {
    fn parse(domain: &str) -> Result<Self, CertIssuanceError> {
        let name = normalize_host(domain);
        let invalid = || CertIssuanceError::InvalidDomain(domain.to_string());

        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }
        if name.is_empty()
            || name.len() > MAX_DOMAIN_LEN
            || name.starts_with('.')
            || name.contains("..")
        {
            return Err(invalid());
        }
        let valid_chars = name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
        if !valid_chars {
            return Err(invalid());
        }
        Ok(Self::Dns(name))
    }

    fn key(&self) -> String {
        match self {
            Self::Dns(name) => name.clone(),
            Self::Ip(ip) => ip.to_string(),
        }
    }

    fn file_stem(&self) -> String {
        self.key().replace(':', "_")
    }

    fn server_name(&self) -> Result<ServerName<'static>, String> {
        match self {
            Self::Dns(name) => ServerName::try_from(name.clone()).map_err(|e| e.to_string()),
            Self::Ip(ip) => Ok(ServerName::IpAddress((*ip).into())),
        }
    }
}

/// Issues, persists and caches per-domain leaf certificates.
pub struct CertificateStore {
    authority: RootAuthority,
    verifier: Arc<WebPkiServerVerifier>,
    dir: PathBuf,
    slots: Mutex<HashMap<String, Slot>>,
}

impl CertificateStore {
    /// Creates a store that signs with `authority` and persists under `dir`.
    pub fn new(authority: RootAuthority, dir: impl AsRef<Path>) -> Result<Self, CertIssuanceError> {
        let verifier = root_verifier(authority.cert_pem())?;
        Ok(Self {
            authority,
            verifier,
            dir: dir.as_ref().to_path_buf(),
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Opens the store rooted at `cert_dir`, generating the root CA if absent.
    ///
    /// Leaves live in `cert_dir/domains`.
    pub fn open(cert_dir: impl AsRef<Path>) -> Result<Self, CertIssuanceError> {
        let cert_dir = cert_dir.as_ref();
        let authority = CaManager::new(cert_dir).ensure_ca()?;
        Self::new(authority, cert_dir.join("domains"))
    }

    /// Root certificate PEM, for client installation.
    pub fn ca_cert_pem(&self) -> &str {
        self.authority.cert_pem()
    }

    /// Directory holding leaf files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of records held in memory.
    pub fn cached(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    /// Certificate and key paths for `domain`.
    pub fn paths_for(&self, domain: &str) -> Result<(PathBuf, PathBuf), CertIssuanceError> {
        let stem = Subject::parse(domain)?.file_stem();
        Ok((
            self.dir.join(format!("{stem}.crt")),
            self.dir.join(format!("{stem}.key")),
        ))
    }

    /// Returns the record for `domain`, issuing one if none exists.
    ///
    /// Blocking: may generate keys and touch the filesystem.
    pub fn get_or_create(&self, domain: &str) -> Result<Arc<CertificateRecord>, CertIssuanceError> {
        let subject = Subject::parse(domain)?;
        let key = subject.key();

        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut guard = slot.lock();
        if let Some(record) = guard.as_ref() {
            return Ok(Arc::clone(record));
        }

        let record = match self.load(&subject)? {
            Some(record) => {
                debug!(domain = %key, "loaded stored certificate");
                record
            }
            None => self.issue(&subject)?,
        };
        let record = Arc::new(record);
        *guard = Some(Arc::clone(&record));
        Ok(record)
    }

    /// Async wrapper running [`Self::get_or_create`] on the blocking pool.
    pub async fn get_or_create_async(
        self: &Arc<Self>,
        domain: &str,
    ) -> Result<Arc<CertificateRecord>, CertIssuanceError> {
        let store = Arc::clone(self);
        let domain = domain.to_string();
        tokio::task::spawn_blocking(move || store.get_or_create(&domain))
            .await
            .map_err(|e| CertIssuanceError::Task(e.to_string()))?
    }

    fn load(&self, subject: &Subject) -> Result<Option<CertificateRecord>, CertIssuanceError> {
        let domain = subject.key();
        let (cert_path, key_path) = self.paths_for(&domain)?;
        if !(cert_path.exists() && key_path.exists()) {
            return Ok(None);
        }

        let load_err = |reason: String| CertIssuanceError::Load {
            domain: domain.clone(),
            reason,
        };

        let cert_pem = fs::read_to_string(&cert_path).map_err(|e| load_err(e.to_string()))?;
        let key_pem = fs::read_to_string(&key_path).map_err(|e| load_err(e.to_string()))?;

        let record = CertificateRecord::from_pem(&domain, cert_pem, key_pem).map_err(load_err)?;

        // Expired leaves and leaves signed by a previous root are replaced.
        if let Err(e) = self.verify(&record, subject) {
            warn!(domain = %domain, error = %e, "stored certificate unusable, reissuing");
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Checks that `record` chains to the current root, is within its
    /// validity window and names `subject`.
    fn verify(&self, record: &CertificateRecord, subject: &Subject) -> Result<(), String> {
        let server_name = subject.server_name()?;
        let leaf = record
            .certified_key
            .cert
            .first()
            .ok_or_else(|| "empty certificate chain".to_string())?;
        self.verifier
            .verify_server_cert(leaf, &[], &server_name, &[], UnixTime::now())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn issue(&self, subject: &Subject) -> Result<CertificateRecord, CertIssuanceError> {
        let domain = subject.key();
        let gen_err = |reason: String| CertIssuanceError::Generation {
            domain: domain.clone(),
            reason,
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain.as_str());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match subject {
            Subject::Dns(name) => SanType::DnsName(
                name.as_str()
                    .try_into()
                    .map_err(|e: rcgen::Error| gen_err(e.to_string()))?,
            ),
            Subject::Ip(ip) => SanType::IpAddress(*ip),
        }];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| gen_err(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, self.authority.issuer())
            .map_err(|e| gen_err(e.to_string()))?;

        let record = CertificateRecord::from_pem(&domain, cert.pem(), key_pair.serialize_pem())
            .map_err(gen_err)?;

        let (cert_path, key_path) = self.paths_for(&domain)?;
        let persist_err = |source| CertIssuanceError::Persist {
            domain: domain.clone(),
            source,
        };
        write_file(&key_path, record.key_pem.as_bytes(), true).map_err(persist_err)?;
        write_file(&cert_path, record.cert_pem.as_bytes(), false).map_err(persist_err)?;

        info!(domain = %domain, path = ?cert_path, "issued leaf certificate");
        Ok(record)
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Verifier trusting only the root CA, used to vet stored leaves.
fn root_verifier(ca_pem: &str) -> Result<Arc<WebPkiServerVerifier>, CertIssuanceError> {
    let root_err = |reason: String| CertIssuanceError::Load {
        domain: "root CA".into(),
        reason,
    };

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        let cert = cert.map_err(|e| root_err(e.to_string()))?;
        roots.add(cert).map_err(|e| root_err(e.to_string()))?;
    }

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| root_err(e.to_string()))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Keep the encoded integer positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Builds a rustls [`CertifiedKey`] from a PEM certificate and PKCS#8 key.
fn certified_key(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, String> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificates in PEM".into());
    }

    let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
        .next()
        .ok_or_else(|| "no private key in PEM".to_string())?
        .map_err(|e| e.to_string())?;

    let signer = any_supported_type(&PrivateKeyDer::from(key)).map_err(|e| e.to_string())?;
    Ok(CertifiedKey::new(certs, signer))
}
