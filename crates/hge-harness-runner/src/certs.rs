// crates/hge-harness-runner/src/certs.rs
// ============================================================================
// Module: Webhook Certificates
// Description: Ephemeral CA, CA-signed leaf and the custom trust bundle.
// Purpose: Serve the auth webhook over TLS that the engine can verify.
// Dependencies: rcgen, time
// ============================================================================

//! ## Overview
//! A fresh CA is generated per test case. The CA signs a leaf certificate for
//! `localhost` and `127.0.0.1` that the auth webhook serves. The system CA
//! directory is copied into `<output>/ssl/certs`, and when the webhook is
//! configured as secure the CA is written next to the copies and appended to
//! `custom-ca-certificates.crt`. The engine reads the directory through
//! `SYSTEM_CERTIFICATE_PATH`; pytest reads the bundle.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use rcgen::BasicConstraints;
use rcgen::CertificateParams;
use rcgen::CertifiedIssuer;
use rcgen::DistinguishedName;
use rcgen::DnType;
use rcgen::ExtendedKeyUsagePurpose;
use rcgen::IsCa;
use rcgen::KeyPair;
use rcgen::KeyUsagePurpose;
use thiserror::Error;
use time::Duration;
use time::OffsetDateTime;
use tracing::debug;
use tracing::info;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default system CA directory copied into the custom certs directory.
pub const SYSTEM_CERTS_DIR: &str = "/etc/ssl/certs";

/// System bundle file name inside the certs directory.
const SYSTEM_BUNDLE_FILE: &str = "ca-certificates.crt";

/// Custom bundle file name inside the certs directory.
pub const CUSTOM_BUNDLE_FILE: &str = "custom-ca-certificates.crt";

/// Webhook CA certificate file name inside the certs directory.
pub const WEBHOOK_CA_FILE: &str = "pytest-webhook.crt";

/// Certificate lifetime in days.
const VALIDITY_DAYS: i64 = 5;

/// Names the leaf certificate is valid for.
const LEAF_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Certificate generation and file errors.
#[derive(Debug, Error)]
pub enum CertError {
    /// Key or certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Generate(String),
    /// Certificate files could not be written.
    #[error("certificate io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Certificate Authority
// ============================================================================

/// PEM encoded certificate and private key.
#[derive(Debug, Clone)]
pub struct CertPair {
    /// Certificate PEM.
    pub cert_pem: String,
    /// PKCS#8 private key PEM.
    pub key_pem: String,
}

/// Ephemeral certificate authority for the auth webhook.
pub struct WebhookCa {
    /// Issuer holding the CA key and self-signed certificate.
    issuer: CertifiedIssuer<'static, KeyPair>,
}

impl WebhookCa {
    /// Generates a new CA key and self-signed certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Generate`] when key generation or signing fails.
    pub fn generate() -> Result<Self, CertError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(generate_error)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("webhook-ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params);
        let issuer = CertifiedIssuer::self_signed(params, key).map_err(generate_error)?;
        Ok(Self {
            issuer,
        })
    }

    /// Returns the CA certificate PEM.
    #[must_use]
    pub fn cert_pem(&self) -> String {
        self.issuer.pem()
    }

    /// Issues a leaf certificate for `localhost` and `127.0.0.1`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Generate`] when key generation or signing fails.
    pub fn issue_leaf(&self) -> Result<CertPair, CertError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(generate_error)?;
        let names: Vec<String> = LEAF_NAMES.iter().map(ToString::to_string).collect();
        let mut params = CertificateParams::new(names).map_err(generate_error)?;
        params.distinguished_name = distinguished_name("localhost");
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::ContentCommitment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params);
        let cert = params.signed_by(&key, &*self.issuer).map_err(generate_error)?;
        Ok(CertPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Builds the subject shared by the CA and the leaf.
fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CountryName, "IN");
    name.push(DnType::OrganizationName, "Hasura Test Harness");
    name.push(DnType::CommonName, common_name);
    name
}

/// Backdates by a day and expires after [`VALIDITY_DAYS`].
fn set_validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);
}

/// Maps an rcgen error.
fn generate_error(err: rcgen::Error) -> CertError {
    CertError::Generate(err.to_string())
}

// ============================================================================
// SECTION: Files
// ============================================================================

/// Certificate files prepared for one webhook run.
#[derive(Debug, Clone)]
pub struct WebhookTlsFiles {
    /// Custom certs directory passed as `SYSTEM_CERTIFICATE_PATH`.
    pub certs_dir: PathBuf,
    /// Custom trust bundle passed as `REQUESTS_CA_BUNDLE`.
    pub bundle_file: PathBuf,
    /// CA certificate file, written only for secure webhooks.
    pub ca_cert_file: Option<PathBuf>,
    /// CA certificate PEM used to verify the webhook before tests start.
    pub ca_cert_pem: String,
    /// Leaf private key served by the webhook.
    pub key_file: PathBuf,
    /// Leaf certificate served by the webhook.
    pub cert_file: PathBuf,
}

impl WebhookTlsFiles {
    /// Generates a CA and leaf and writes them under `<output_dir>/ssl`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when generation fails or files cannot be written.
    pub fn prepare(output_dir: &Path, system_certs_dir: &Path, secure: bool) -> Result<Self, CertError> {
        let ssl_dir = std::path::absolute(output_dir.join("ssl")).map_err(io_error)?;
        let certs_dir = ssl_dir.join("certs");
        fs::create_dir_all(&certs_dir).map_err(io_error)?;
        copy_system_certs(system_certs_dir, &certs_dir)?;

        let bundle_file = certs_dir.join(CUSTOM_BUNDLE_FILE);
        let system_bundle = certs_dir.join(SYSTEM_BUNDLE_FILE);
        if system_bundle.is_file() {
            fs::copy(&system_bundle, &bundle_file).map_err(io_error)?;
        } else {
            fs::write(&bundle_file, b"").map_err(io_error)?;
        }

        let ca = WebhookCa::generate()?;
        let ca_cert_pem = ca.cert_pem();
        let ca_cert_file = if secure {
            let path = certs_dir.join(WEBHOOK_CA_FILE);
            fs::write(&path, &ca_cert_pem).map_err(io_error)?;
            let mut bundle = OpenOptions::new().append(true).open(&bundle_file).map_err(io_error)?;
            bundle.write_all(ca_cert_pem.as_bytes()).map_err(io_error)?;
            Some(path)
        } else {
            None
        };

        let leaf = ca.issue_leaf()?;
        let key_file = ssl_dir.join("webhook.key");
        let cert_file = ssl_dir.join("webhook.crt");
        fs::write(&key_file, leaf.key_pem).map_err(io_error)?;
        fs::write(&cert_file, leaf.cert_pem).map_err(io_error)?;
        info!(certs_dir = %certs_dir.display(), secure, "prepared webhook certificates");

        Ok(Self {
            certs_dir,
            bundle_file,
            ca_cert_file,
            ca_cert_pem,
            key_file,
            cert_file,
        })
    }

    /// Removes the CA certificate, the bundle and the leaf files. Missing
    /// files are ignored.
    pub fn remove(&self) {
        let files = [
            self.ca_cert_file.as_deref(),
            Some(self.bundle_file.as_path()),
            Some(self.key_file.as_path()),
            Some(self.cert_file.as_path()),
        ];
        for path in files.into_iter().flatten() {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed certificate file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => debug!(path = %path.display(), error = %err, "failed to remove certificate file"),
            }
        }
    }
}

/// Copies the regular files of `source` into `target`. A missing source is
/// treated as empty.
fn copy_system_certs(source: &Path, target: &Path) -> Result<(), CertError> {
    let entries = match fs::read_dir(source) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %source.display(), "system certificate directory not found");
            return Ok(());
        }
        Err(err) => return Err(io_error(err)),
    };
    for entry in entries {
        let entry = entry.map_err(io_error)?;
        let path = entry.path();
        if !fs::metadata(&path).is_ok_and(|meta| meta.is_file()) {
            continue;
        }
        fs::copy(&path, target.join(entry.file_name())).map_err(io_error)?;
    }
    Ok(())
}

/// Maps an io error.
fn io_error(err: std::io::Error) -> CertError {
    CertError::Io(err.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use std::fs;

    use tempfile::TempDir;

    use super::CUSTOM_BUNDLE_FILE;
    use super::WebhookTlsFiles;

    #[test]
    fn secure_webhook_extends_the_bundle() {
        let system = TempDir::new().unwrap();
        fs::write(system.path().join("ca-certificates.crt"), "SYSTEM\n").unwrap();
        let output = TempDir::new().unwrap();

        let files = WebhookTlsFiles::prepare(output.path(), system.path(), true).unwrap();
        let bundle = fs::read_to_string(&files.bundle_file).unwrap();
        assert!(bundle.starts_with("SYSTEM\n"));
        assert!(bundle.contains("BEGIN CERTIFICATE"));
        assert!(files.ca_cert_file.as_ref().unwrap().is_file());
        assert!(fs::read_to_string(&files.key_file).unwrap().contains("PRIVATE KEY"));

        files.remove();
        files.remove();
        assert!(!files.bundle_file.exists());
        assert!(!files.key_file.exists());
    }

    #[test]
    fn insecure_webhook_keeps_the_system_bundle() {
        let system = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();

        let files = WebhookTlsFiles::prepare(output.path(), &system.path().join("missing"), false).unwrap();
        assert!(files.ca_cert_file.is_none());
        assert_eq!(files.bundle_file.file_name().unwrap(), CUSTOM_BUNDLE_FILE);
        assert_eq!(fs::read_to_string(&files.bundle_file).unwrap(), "");
        assert!(files.ca_cert_pem.contains("BEGIN CERTIFICATE"));
    }
}
