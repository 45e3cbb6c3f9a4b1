//! Seam to the external cryptographic service.
//!
//! The core never inspects key material. It hands bytes to [`Crypto::pack`]
//! and [`Crypto::unpack`] and only decides which trust flags may be affirmed
//! from what comes back.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DcommError, DcommResult};
use crate::trust::TrustContext;

/// Result of unpacking one wire-format message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub plaintext: Vec<u8>,
    /// Present only when the service proved who sent it.
    pub sender_key: Option<String>,
    pub recipient_key: Option<String>,
}

/// Authenticated-encryption service (wallet, HSM, ...).
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Encrypt `plaintext` for `recipients`, optionally authenticated as `sender_key`.
    async fn pack(
        &self,
        plaintext: &[u8],
        sender_key: Option<&str>,
        recipients: &[String],
    ) -> DcommResult<Vec<u8>>;

    /// Decrypt a wire-format message.
    async fn unpack(&self, wire: &[u8]) -> DcommResult<Unpacked>;

    /// Which of confidentiality/integrity this service really provides.
    fn guarantees(&self) -> u32 {
        TrustContext::CONFIDENTIALITY | TrustContext::INTEGRITY
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    protected: String,
    iv: String,
    ciphertext: String,
    tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProtectedHeader {
    enc: String,
    typ: String,
    alg: String,
    recipients: Vec<RecipientHeader>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecipientHeader {
    kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
}

/// Produces wire-format-shaped JSON with base64 content and no encryption.
///
/// For development and tests only. It reports no guarantees, so nothing it
/// unpacks is ever treated as confidential or tamper-evident.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCrypto;

impl PassthroughCrypto {
    pub fn new() -> Self {
        Self
    }
}

fn decode(field: &str, value: &str) -> DcommResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| DcommError::Crypto(format!("bad base64 in {field}: {e}")))
}

#[async_trait]
impl Crypto for PassthroughCrypto {
    async fn pack(
        &self,
        plaintext: &[u8],
        sender_key: Option<&str>,
        recipients: &[String],
    ) -> DcommResult<Vec<u8>> {
        let header = ProtectedHeader {
            enc: "none".to_string(),
            typ: "JWM/1.0".to_string(),
            alg: "passthrough".to_string(),
            recipients: recipients
                .iter()
                .map(|kid| RecipientHeader {
                    kid: kid.clone(),
                    sender: sender_key.map(str::to_string),
                })
                .collect(),
        };
        let wire = WireMessage {
            protected: URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            iv: String::new(),
            ciphertext: URL_SAFE_NO_PAD.encode(plaintext),
            tag: String::new(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    async fn unpack(&self, wire: &[u8]) -> DcommResult<Unpacked> {
        let wire: WireMessage = serde_json::from_slice(wire)
            .map_err(|e| DcommError::Crypto(format!("not a wire message: {e}")))?;
        let header: ProtectedHeader = serde_json::from_slice(&decode("protected", &wire.protected)?)
            .map_err(|e| DcommError::Crypto(format!("bad protected header: {e}")))?;
        let first = header.recipients.into_iter().next();
        Ok(Unpacked {
            plaintext: decode("ciphertext", &wire.ciphertext)?,
            sender_key: first.as_ref().and_then(|r| r.sender.clone()),
            recipient_key: first.map(|r| r.kid),
        })
    }

    fn guarantees(&self) -> u32 {
        0
    }
}
