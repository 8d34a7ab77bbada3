//! Webhook request types shared by the adapter and the hosting layer

use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// WeChat webhook query parameters (GET verification and POST messages)
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookParams {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    #[serde(default)]
    pub echostr: Option<String>,
    #[serde(default)]
    pub encrypt_type: Option<String>,
    #[serde(default)]
    pub msg_signature: Option<String>,
}

/// Per-request authentication material
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretInfo {
    pub webhook_signature: String,
    pub timestamp: String,
    pub nonce: String,
    /// Present only on verification requests
    pub echo_string: Option<String>,
    /// Key used for this request; falls back to the settings key when unset
    pub encoding_aes_key: Option<String>,
    /// Signature over the `Encrypt` field, present in safe mode
    pub msg_signature: Option<String>,
}

impl SecretInfo {
    /// Build from webhook query parameters
    pub fn from_params(params: WebhookParams, settings: &Settings) -> Self {
        Self {
            webhook_signature: params.signature,
            timestamp: params.timestamp,
            nonce: params.nonce,
            echo_string: params.echostr,
            encoding_aes_key: settings.encoding_aes_key.clone(),
            msg_signature: params.msg_signature,
        }
    }

    /// The verification echo, if this is a handshake request
    pub fn echo(&self) -> Option<&str> {
        self.echo_string.as_deref().filter(|s| !s.is_empty())
    }
}

/// Encrypted message wrapper
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "xml")]
pub struct EncryptedMessage {
    #[serde(rename = "Encrypt", default)]
    pub encrypt: Option<String>,
}
