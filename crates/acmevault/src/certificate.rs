//! Issued certificates and their secret-store representation.
//!
//! A certificate is stored as two secrets per domain:
//!
//! ```text
//! <prefix>/client/<domain>/certificate   domain, cert, issuer, csr, url, stable_url
//! <prefix>/client/<domain>/privatekey    private_key
//! ```
//!
//! Binary fields are base64 (standard alphabet) encoded PEM.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Key/value payload of a single secret
pub type SecretData = Map<String, Value>;

const KEY_DOMAIN: &str = "domain";
const KEY_CERT: &str = "cert";
const KEY_ISSUER: &str = "issuer";
const KEY_CSR: &str = "csr";
const KEY_URL: &str = "url";
const KEY_STABLE_URL: &str = "stable_url";
const KEY_PRIVATE_KEY: &str = "private_key";

/// Errors produced while decoding or inspecting certificate material
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate data is missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not valid base64: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("malformed certificate: {0}")]
    Malformed(String),
}

/// An issued certificate bundle
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pub domain: String,
    /// PEM chain, leaf first
    pub certificate: Vec<u8>,
    /// PEM private key, only present in the full view
    pub private_key: Option<Vec<u8>>,
    /// PEM chain without the leaf
    pub issuer_certificate: Vec<u8>,
    /// PEM certificate signing request
    pub csr: Vec<u8>,
    pub cert_url: String,
    pub cert_stable_url: String,
}

impl Certificate {
    /// Secret payload for the public `certificate` path
    pub fn to_public_data(&self) -> SecretData {
        let mut data = Map::new();
        data.insert(KEY_DOMAIN.into(), Value::String(self.domain.clone()));
        data.insert(KEY_CERT.into(), Value::String(STANDARD.encode(&self.certificate)));
        data.insert(
            KEY_ISSUER.into(),
            Value::String(STANDARD.encode(&self.issuer_certificate)),
        );
        data.insert(KEY_CSR.into(), Value::String(STANDARD.encode(&self.csr)));
        data.insert(KEY_URL.into(), Value::String(self.cert_url.clone()));
        data.insert(KEY_STABLE_URL.into(), Value::String(self.cert_stable_url.clone()));
        data
    }

    /// Secret payload for the `privatekey` path, `None` without a key
    pub fn to_private_data(&self) -> Option<SecretData> {
        self.private_key.as_ref().map(|key| {
            let mut data = Map::new();
            data.insert(KEY_PRIVATE_KEY.into(), Value::String(STANDARD.encode(key)));
            data
        })
    }

    /// Decode the public view.
    ///
    /// A `private_key` entry in `data` is ignored.
    pub fn from_public_data(data: &SecretData) -> Result<Self, CertificateError> {
        let domain = string_field(data, KEY_DOMAIN).ok_or(CertificateError::MissingField(KEY_DOMAIN))?;
        let certificate =
            decode_field(data, KEY_CERT)?.ok_or(CertificateError::MissingField(KEY_CERT))?;

        let csr = match decode_field(data, KEY_CSR) {
            Ok(csr) => csr.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "Could not decode stored CSR");
                Vec::new()
            }
        };

        Ok(Self {
            domain,
            certificate,
            private_key: None,
            issuer_certificate: decode_field(data, KEY_ISSUER)?.unwrap_or_default(),
            csr,
            cert_url: string_field(data, KEY_URL).unwrap_or_default(),
            cert_stable_url: string_field(data, KEY_STABLE_URL).unwrap_or_default(),
        })
    }

    /// Merge the `privatekey` secret into a public view
    pub fn with_private_data(mut self, data: &SecretData) -> Result<Self, CertificateError> {
        let key = decode_field(data, KEY_PRIVATE_KEY)?
            .ok_or(CertificateError::MissingField(KEY_PRIVATE_KEY))?;
        self.private_key = Some(key);
        Ok(self)
    }

    /// Drop the private key
    pub fn without_private_key(mut self) -> Self {
        self.private_key = None;
        self
    }

    /// Expiry of the first certificate in the chain
    pub fn expiry(&self) -> Result<DateTime<Utc>, CertificateError> {
        with_leaf(&self.certificate, |cert| {
            let timestamp = cert.validity().not_after.timestamp();
            DateTime::from_timestamp(timestamp, 0)
                .ok_or_else(|| CertificateError::Malformed("invalid expiry timestamp".to_string()))
        })
    }

    /// DNS names from the leaf's subject alternative name extension
    pub fn dns_names(&self) -> Result<Vec<String>, CertificateError> {
        with_leaf(&self.certificate, |cert| {
            let mut names = Vec::new();
            if let Ok(Some(san)) = cert.subject_alternative_name() {
                for name in &san.value.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
            Ok(names)
        })
    }

    /// Private key followed by the chain, for consumers that want one file
    pub fn pem_bundle(&self) -> Option<Vec<u8>> {
        let key = self.private_key.as_ref()?;
        let mut bundle = Vec::with_capacity(key.len() + self.certificate.len() + 1);
        bundle.extend_from_slice(key);
        if !key.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(&self.certificate);
        Some(bundle)
    }
}

/// Split a PEM chain into its leaf and the remaining issuer chain
pub fn split_chain(chain: &str) -> (String, String) {
    const END: &str = "-----END CERTIFICATE-----";
    match chain.find(END) {
        Some(idx) => {
            let split = idx + END.len();
            let leaf = format!("{}\n", chain[..split].trim());
            let issuer = chain[split..].trim();
            let issuer = if issuer.is_empty() {
                String::new()
            } else {
                format!("{}\n", issuer)
            };
            (leaf, issuer)
        }
        None => (chain.to_string(), String::new()),
    }
}

fn with_leaf<T>(
    chain: &[u8],
    f: impl FnOnce(&X509Certificate<'_>) -> Result<T, CertificateError>,
) -> Result<T, CertificateError> {
    if chain.is_empty() {
        return Err(CertificateError::Malformed("empty certificate data".to_string()));
    }

    let (_, pem) = x509_parser::pem::parse_x509_pem(chain)
        .map_err(|e| CertificateError::Malformed(format!("failed to parse PEM: {}", e)))?;

    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| CertificateError::Malformed(format!("failed to parse certificate: {}", e)))?;

    f(&cert)
}

fn string_field(data: &SecretData, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn decode_field(data: &SecretData, key: &'static str) -> Result<Option<Vec<u8>>, CertificateError> {
    match data.get(key).and_then(Value::as_str) {
        Some(raw) => STANDARD
            .decode(raw)
            .map(Some)
            .map_err(|source| CertificateError::Decode { field: key, source }),
        None => Ok(None),
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("domain", &self.domain)
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .field("issuer_len", &self.issuer_certificate.len())
            .field("cert_url", &self.cert_url)
            .finish()
    }
}
