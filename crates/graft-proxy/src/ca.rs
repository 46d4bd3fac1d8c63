//! Root certificate authority management.
//!
//! Generates and loads the root CA used to sign per-domain leaf certificates
//! for intercepted tunnels. Clients must trust this certificate.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "graft-ca.crt";
const CA_KEY_FILENAME: &str = "graft-ca.key";

const CA_COMMON_NAME: &str = "Graft Root CA";
const CA_VALIDITY_DAYS: i64 = 3650;

/// A loaded root CA, ready to sign leaf certificates.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
}

impl RootAuthority {
    /// The issuer used to sign leaves.
    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// The root certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootAuthority").finish_non_exhaustive()
    }
}

/// Manages the root CA files on disk.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default graft data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        default_cert_dir()
            .map(Self::new)
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))
    }

    /// Directory holding the CA files.
    pub fn dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA exists, generating it if necessary, and loads it.
    pub fn ensure_ca(&self) -> Result<RootAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Graft");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        // Key first: a cert without its key is useless.
        write_file(&self.key_path(), key_pair.serialize_pem().as_bytes(), true)
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        write_file(&self.cert_path(), cert.pem().as_bytes(), false)
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and key into a signing authority.
    pub fn load_authority(&self) -> Result<RootAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RootAuthority { issuer, cert_pem })
    }

    /// Reads the CA certificate PEM (for client installation).
    pub fn read_cert_pem(&self) -> Result<String, CaManagerError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }
}

/// Default certificate directory under the platform data dir.
pub fn default_cert_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "graft", "Graft")
        .map(|dirs| dirs.data_dir().join("certs"))
}

/// Writes `data` to `path` through a temporary file and rename.
///
/// Private files are created with mode 0600 on unix.
pub(crate) fn write_file(path: &Path, data: &[u8], private: bool) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = path.with_file_name(tmp_name);
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        if private {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        #[cfg(not(unix))]
        let _ = private;

        let mut file = options.open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
