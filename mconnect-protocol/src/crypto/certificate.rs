//! Device Certificates
//!
//! Each device presents a self-signed certificate during the TLS upgrade. The
//! certificate is never part of the identity packet; peers only see it inside
//! the handshake and decide whether to trust it when pairing.
//!
//! ## Certificate Shape
//!
//! - **Key**: ECDSA on NIST P-384, freshly generated per call
//! - **Serial Number**: random 128-bit
//! - **Subject / Issuer**: `CN=<entity>, O=mconnect, OU=mconnect`
//! - **Validity**: now until 10 years from now
//! - **Basic Constraints**: present, critical, not a CA
//! - **Signature**: ECDSA with SHA-384

use crate::{ProtocolError, Result};
use chrono::{Duration, Months, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509NameRef, X509};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate validity period
const CERT_VALIDITY_MONTHS: u32 = 12 * 10;

/// Organization and organizational unit in the certificate subject
const CERT_ORG: &str = "mconnect";

/// Bits in the random serial number
const SERIAL_BITS: i32 = 128;

/// A device's TLS credentials
#[derive(Clone)]
pub struct DeviceCertificate {
    /// Entity name, the certificate's Common Name
    pub entity: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    private_key: Vec<u8>,

    /// SHA256 fingerprint of certificate (for user verification)
    pub fingerprint: String,
}

impl DeviceCertificate {
    /// Generate a new self-signed certificate for a device
    ///
    /// Any failure of the entropy source, key generation or signing is returned
    /// as is. There is no retry.
    ///
    /// # Examples
    ///
    /// ```
    /// use mconnect_protocol::DeviceCertificate;
    ///
    /// let cert = DeviceCertificate::generate("mconnect-host").unwrap();
    /// assert_eq!(cert.entity, "mconnect-host");
    /// ```
    pub fn generate(entity: impl Into<String>) -> Result<Self> {
        let entity = entity.into();

        let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
        let pkey = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut builder = X509::builder()?;

        // X509v3
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG)?;
        name.append_entry_by_text("CN", &entity)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Utc::now();
        let not_after = not_before
            .checked_add_months(Months::new(CERT_VALIDITY_MONTHS))
            .unwrap_or_else(|| not_before + Duration::days(3652));
        let not_before = Asn1Time::from_unix(not_before.timestamp())?;
        let not_after = Asn1Time::from_unix(not_after.timestamp())?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.sign(&pkey, MessageDigest::sha384())?;

        let cert = builder.build();
        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for {} with fingerprint: {}",
            entity, fingerprint
        );

        Ok(Self {
            entity,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Certificate and private key ready to hand to a TLS context
    pub fn tls_credentials(&self) -> Result<(X509, PKey<Private>)> {
        let cert = X509::from_der(&self.certificate)?;
        let key = PKey::private_key_from_der(&self.private_key)?;
        Ok((cert, key))
    }

    /// Calculate SHA256 fingerprint of a DER certificate
    ///
    /// Returns fingerprint in format: XX:XX:XX:...:XX
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        let hash = hasher.finalize();

        hash.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)
                .map_err(|e| ProtocolError::transport("failed to create certificate dir", e))?;
        }

        let (cert, key) = self.tls_credentials()?;
        fs::write(cert_path, cert.to_pem()?)
            .map_err(|e| ProtocolError::transport("failed to write certificate", e))?;
        fs::write(key_path, key.private_key_to_pem_pkcs8()?)
            .map_err(|e| ProtocolError::transport("failed to write private key", e))?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );
        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert_pem = fs::read(cert_path)
            .map_err(|e| ProtocolError::transport("failed to read certificate", e))?;
        let cert = X509::from_pem(&cert_pem)?;

        let key_pem = fs::read(key_path)
            .map_err(|e| ProtocolError::transport("failed to read private key", e))?;
        let key = PKey::private_key_from_pem(&key_pem)?;

        let entity = name_entry(cert.subject_name(), Nid::COMMONNAME).unwrap_or_default();

        let certificate = cert.to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Loaded certificate for {} with fingerprint: {}",
            entity, fingerprint
        );

        Ok(Self {
            entity,
            certificate,
            private_key: key.private_key_to_der()?,
            fingerprint,
        })
    }
}

/// Text of the first `nid` entry in `name`
fn name_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
}

impl fmt::Debug for DeviceCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCertificate")
            .field("entity", &self.entity)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::Id;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_generation() {
        let cert = DeviceCertificate::generate("test_device_123").unwrap();

        assert_eq!(cert.entity, "test_device_123");
        assert!(!cert.certificate.is_empty());
        assert!(!cert.fingerprint.is_empty());

        let (x509, key) = cert.tls_credentials().unwrap();
        assert_eq!(key.id(), Id::EC);
        assert_eq!(key.bits(), 384);
        assert!(x509.verify(&key).unwrap());
    }

    #[test]
    fn test_certificate_subject() {
        let cert = DeviceCertificate::generate("mconnect-box").unwrap();
        let (x509, _) = cert.tls_credentials().unwrap();

        assert_eq!(
            name_entry(x509.subject_name(), Nid::COMMONNAME).as_deref(),
            Some("mconnect-box")
        );
        assert_eq!(
            name_entry(x509.subject_name(), Nid::ORGANIZATIONNAME).as_deref(),
            Some("mconnect")
        );
        assert_eq!(
            name_entry(x509.subject_name(), Nid::ORGANIZATIONALUNITNAME).as_deref(),
            Some("mconnect")
        );

        // Self-signed: issuer is the subject
        assert_eq!(
            name_entry(x509.issuer_name(), Nid::COMMONNAME).as_deref(),
            Some("mconnect-box")
        );
        assert_eq!(name_entry(x509.subject_name(), Nid::PKCS9_EMAILADDRESS), None);
    }

    #[test]
    fn test_certificate_validity_ten_years() {
        let cert = DeviceCertificate::generate("device").unwrap();
        let (x509, _) = cert.tls_credentials().unwrap();

        let diff = x509.not_before().diff(x509.not_after()).unwrap();
        // 10 calendar years: 3652 or 3653 days depending on leap years
        assert!(diff.days >= 3652 && diff.days <= 3653, "days = {}", diff.days);
    }

    #[test]
    fn test_certificate_serial_random() {
        let a = DeviceCertificate::generate("device").unwrap();
        let b = DeviceCertificate::generate("device").unwrap();
        let (a, _) = a.tls_credentials().unwrap();
        let (b, _) = b.tls_credentials().unwrap();

        let a = a.serial_number().to_bn().unwrap();
        let b = b.serial_number().to_bn().unwrap();
        assert_ne!(a, b);
        assert!(a.num_bits() <= SERIAL_BITS);
    }

    #[test]
    fn test_certificate_fingerprint() {
        let cert1 = DeviceCertificate::generate("device1").unwrap();
        let cert2 = DeviceCertificate::generate("device2").unwrap();

        assert_ne!(cert1.fingerprint, cert2.fingerprint);
        assert_eq!(
            DeviceCertificate::calculate_fingerprint(&cert1.certificate),
            cert1.fingerprint
        );

        let parts: Vec<&str> = cert1.fingerprint.split(':').collect();
        assert_eq!(parts.len(), 32);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_certificate_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("certs/device.crt");
        let key_path = temp_dir.path().join("certs/device.key");

        let original = DeviceCertificate::generate("test_device").unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        assert!(cert_path.exists());
        assert!(key_path.exists());

        let loaded = DeviceCertificate::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.entity, "test_device");
        assert_eq!(loaded.fingerprint, original.fingerprint);
        assert!(loaded.tls_credentials().is_ok());
    }

    #[test]
    fn test_load_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let result = DeviceCertificate::load_from_files(
            temp_dir.path().join("nope.crt"),
            temp_dir.path().join("nope.key"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_hides_private_key() {
        let cert = DeviceCertificate::generate("device").unwrap();
        let debug = format!("{:?}", cert);
        assert!(debug.contains("device"));
        assert!(!debug.contains("private_key"));
    }
}
