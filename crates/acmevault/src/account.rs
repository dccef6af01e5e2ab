//! ACME account records and short-lived cloud credentials.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::certificate::{CertificateError, SecretData};

const KEY_EMAIL: &str = "email";
const KEY_URI: &str = "uri";
const KEY_ACCOUNT: &str = "account";
const KEY_KEY: &str = "key";

/// A registered (or about to be registered) ACME account
#[derive(Clone, PartialEq)]
pub struct AcmeAccount {
    pub email: String,
    /// Account URL assigned by the CA, empty until registered
    pub uri: String,
    /// Serialized account credentials, `Value::Null` until registered
    pub account: Value,
    /// PEM (PKCS#8) account private key, empty until registered
    pub key: String,
}

impl AcmeAccount {
    /// Account that has not been registered with the CA yet
    pub fn pending(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            uri: String::new(),
            account: Value::Null,
            key: String::new(),
        }
    }

    /// Whether the CA registration is present
    pub fn is_registered(&self) -> bool {
        !self.uri.is_empty() && !self.account.is_null()
    }

    /// Build a registered account from the CA's credentials document.
    ///
    /// The PEM key is derived from the `key_pkcs8` member.
    pub fn from_credentials(
        email: impl Into<String>,
        uri: impl Into<String>,
        credentials: Value,
    ) -> Result<Self, CertificateError> {
        let pkcs8 = credentials
            .get("key_pkcs8")
            .and_then(Value::as_str)
            .ok_or(CertificateError::MissingField("key_pkcs8"))?;

        let der = URL_SAFE_NO_PAD
            .decode(pkcs8.trim_end_matches('='))
            .map_err(|source| CertificateError::Decode {
                field: "key_pkcs8",
                source,
            })?;

        Ok(Self {
            email: email.into(),
            uri: uri.into(),
            account: credentials,
            key: pem::encode_config(
                &pem::Pem::new("PRIVATE KEY", der),
                pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
            ),
        })
    }

    pub fn to_data(&self) -> SecretData {
        let mut data = SecretData::new();
        data.insert(KEY_EMAIL.into(), Value::String(self.email.clone()));
        data.insert(KEY_URI.into(), Value::String(self.uri.clone()));
        data.insert(
            KEY_ACCOUNT.into(),
            Value::String(self.account.to_string()),
        );
        data.insert(KEY_KEY.into(), Value::String(self.key.clone()));
        data
    }

    pub fn from_data(data: &SecretData) -> Result<Self, CertificateError> {
        let field = |key: &'static str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(CertificateError::MissingField(key))
        };

        let raw_account = field(KEY_ACCOUNT)?;
        let account = serde_json::from_str(&raw_account)
            .map_err(|e| CertificateError::Malformed(format!("account document: {}", e)))?;

        Ok(Self {
            email: field(KEY_EMAIL)?,
            uri: field(KEY_URI)?,
            account,
            key: field(KEY_KEY)?,
        })
    }
}

impl fmt::Debug for AcmeAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeAccount")
            .field("email", &self.email)
            .field("uri", &self.uri)
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Dynamic cloud credentials minted by the secrets store
#[derive(Clone)]
pub struct CloudCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

impl CloudCredentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("expiry", &self.expiry)
            .finish()
    }
}
