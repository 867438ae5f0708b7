//! X.509 primitives for the cluster CA and the leaf bundles it signs.
//!
//! Keys are ECDSA P-256 (rcgen's default). The CA is valid for ten years,
//! leaves for one; every leaf carries both client and server auth usages so
//! the same bundle works for peer and client connections.

use chrono::{Datelike, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Organization placed in every certificate subject.
pub const ORGANIZATION: &str = "vault.microscaler.io";

/// Common name of the cluster CA.
pub const CA_COMMON_NAME: &str = "vault operator CA";

/// CA validity in years
pub const CA_VALIDITY_YEARS: i32 = 10;

/// Leaf validity in years
pub const LEAF_VALIDITY_YEARS: i32 = 1;

/// Errors raised while generating, parsing or verifying certificates.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    /// PEM or DER could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// Signature did not verify
    #[error("certificate verification failed: {0}")]
    Verification(String),
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// Sets the validity window of a certificate issued now.
///
/// `not_before` is backdated one day to tolerate clock skew between nodes.
/// The day is clamped to 28 so the same date exists in every month.
fn set_validity(params: &mut CertificateParams, years: i32) {
    let start = Utc::now() - chrono::Duration::days(1);
    let day = start.day().min(28) as u8;
    let month = start.month() as u8;
    params.not_before = rcgen::date_time_ymd(start.year(), month, day);
    params.not_after = rcgen::date_time_ymd(start.year() + years, month, day);
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string()));
    dn
}

fn san_entries(sans: &[String]) -> Result<Vec<SanType>> {
    sans.iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| PkiError::Certificate(format!("invalid DNS name '{}': {}", san, e)))
            }
        })
        .collect()
}

/// Decode a single PEM block into DER.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A freshly generated key and certificate signed by the cluster CA.
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub key_pem: String,
    pub cert_pem: String,
}

/// The cluster CA: key and self-signed certificate, both PEM.
///
/// rcgen's `KeyPair` is not `Clone`, so the key is kept serialized and
/// loaded when signing.
#[derive(Clone)]
pub struct CaKeyPair {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeyPair").finish_non_exhaustive()
    }
}

impl CaKeyPair {
    /// Generate a new self-signed CA.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_YEARS);

        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate CA key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Certificate(format!("failed to create CA cert: {}", e)))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load a CA previously persisted as PEM. Both halves must parse.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?;
        let der = parse_pem(cert_pem)?;
        X509Certificate::from_der(&der)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {}", e)))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Generate a key and a certificate for it, signed by this CA.
    pub fn sign_leaf(&self, common_name: &str, sans: &[String]) -> Result<LeafCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, LEAF_VALIDITY_YEARS);
        params.subject_alt_names = san_entries(sans)?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate leaf key: {}", e)))?;

        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| PkiError::Certificate(format!("failed to sign '{}': {}", common_name, e)))?;

        Ok(LeafCertificate {
            key_pem: leaf_key.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }
}

/// Verify that `cert_pem` carries a valid signature from `ca_pem`.
pub fn verify_signed_by(cert_pem: &str, ca_pem: &str) -> Result<()> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse cert: {}", e)))?;
    let ca_der = parse_pem(ca_pem)?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {}", e)))?;

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|e| PkiError::Verification(format!("signature does not match CA: {}", e)))
}

/// Verify that `ca_pem` is a CA certificate signed by its own key.
pub fn verify_self_signed(ca_pem: &str) -> Result<()> {
    let der = parse_pem(ca_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {}", e)))?;
    if !cert.is_ca() {
        return Err(PkiError::Verification("certificate is not a CA".to_string()));
    }
    cert.verify_signature(None)
        .map_err(|e| PkiError::Verification(format!("CA is not self-signed: {}", e)))
}

/// DNS names in the certificate's subjectAltName extension.
pub fn dns_sans(cert_pem: &str) -> Result<Vec<String>> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse cert: {}", e)))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::Parse(format!("invalid subjectAltName: {}", e)))?;

    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some((*dns).to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Subject common name, empty if absent.
pub fn common_name(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse cert: {}", e)))?;
    Ok(cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_is_self_signed() {
        let ca = CaKeyPair::generate().unwrap();
        verify_self_signed(ca.cert_pem()).unwrap();
        assert_eq!(common_name(ca.cert_pem()).unwrap(), CA_COMMON_NAME);
    }

    #[test]
    fn test_leaf_verifies_against_its_ca() {
        let ca = CaKeyPair::generate().unwrap();
        let leaf = ca
            .sign_leaf("vault server", &["localhost".to_string(), "*.ns.pod".to_string()])
            .unwrap();

        verify_signed_by(&leaf.cert_pem, ca.cert_pem()).unwrap();
        assert_eq!(common_name(&leaf.cert_pem).unwrap(), "vault server");
        assert_eq!(dns_sans(&leaf.cert_pem).unwrap(), vec!["localhost", "*.ns.pod"]);
    }

    #[test]
    fn test_leaf_rejected_by_another_ca() {
        let ca = CaKeyPair::generate().unwrap();
        let other = CaKeyPair::generate().unwrap();
        let leaf = ca.sign_leaf("etcd peer", &[]).unwrap();

        let result = verify_signed_by(&leaf.cert_pem, other.cert_pem());
        assert!(matches!(result, Err(PkiError::Verification(_))));
    }

    #[test]
    fn test_leaf_is_not_a_ca() {
        let ca = CaKeyPair::generate().unwrap();
        let leaf = ca.sign_leaf("etcd client", &[]).unwrap();
        assert!(verify_self_signed(&leaf.cert_pem).is_err());
        assert!(dns_sans(&leaf.cert_pem).unwrap().is_empty());
    }

    #[test]
    fn test_ca_reloads_from_pem_and_keeps_signing() {
        let ca = CaKeyPair::generate().unwrap();
        let reloaded = CaKeyPair::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();
        let leaf = reloaded.sign_leaf("vault server", &["localhost".to_string()]).unwrap();
        verify_signed_by(&leaf.cert_pem, ca.cert_pem()).unwrap();
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        let ca = CaKeyPair::generate().unwrap();
        assert!(CaKeyPair::from_pem("not pem", ca.key_pem()).is_err());
        assert!(CaKeyPair::from_pem(ca.cert_pem(), "not pem").is_err());
    }
}
