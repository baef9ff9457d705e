use crate::cipher::KEY_SIZE;
use crate::error::{OdsError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 32 bytes of shared secret. Used both as an HS256 signing key and as an
/// AES-256 key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            OdsError::InvalidKey(format!(
                "key must decode to exactly {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|error| OdsError::InvalidKey(format!("key is not valid base64: {}", error)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Stage {
    #[default]
    Prod,
    Test,
    Dev,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "Prod",
            Self::Test => "Test",
            Self::Dev => "Dev",
        }
    }

    /// Unknown values fall back to `Prod`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for Stage {
    type Err = OdsError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" => Ok(Self::Prod),
            "test" => Ok(Self::Test),
            "dev" | "develop" => Ok(Self::Dev),
            other => Err(OdsError::InvalidRequest(format!("unknown stage: {}", other))),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// This node's own descriptive record. The key is fetched separately via
/// `PeerStore::node_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub issuer: String,
    pub name: String,
    pub url: Option<String>,
    pub stage: Stage,
    pub firewalled_mode: bool,
}

impl NodeIdentity {
    pub fn profile(&self) -> NodeProfile {
        NodeProfile {
            issuer: self.issuer.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            stage: self.stage,
            firewalled_mode: self.firewalled_mode,
        }
    }
}

/// Peer-facing self description returned by `GET /about`. Never carries a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub issuer: String,
    pub name: String,
    pub url: Option<String>,
    pub stage: Stage,
    pub firewalled_mode: bool,
}

/// Mutable descriptive fields of the local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDefaults {
    pub name: String,
    pub url: Option<String>,
    pub stage: Stage,
    pub firewalled_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub issuer: String,
    pub url: String,
    pub name: String,
    pub stage: Stage,
    pub firewalled_mode: bool,
    pub registered_on: DateTime<Utc>,
}

/// Decrypted content of the `iss_data` registration claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub firewalled_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_base64_round_trip() {
        let key = SecretKey::generate();
        let decoded = SecretKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_secret_key_rejects_wrong_length() {
        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            SecretKey::from_base64(&short),
            Err(OdsError::InvalidKey(_))
        ));
        assert!(matches!(
            SecretKey::from_base64("%%%"),
            Err(OdsError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let key = SecretKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(format!("{:?}", key), "SecretKey(<redacted>)");
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!(Stage::parse_lenient("test"), Stage::Test);
        assert_eq!(Stage::parse_lenient("Develop"), Stage::Dev);
        assert_eq!(Stage::parse_lenient("staging"), Stage::Prod);
    }
}
