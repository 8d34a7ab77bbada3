//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::WechatCrypto;
use crate::error::AdapterError;

/// Length of a WeChat EncodingAESKey
pub const ENCODING_AES_KEY_LEN: usize = 43;

/// Adapter settings, read-only after load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// WeChat token for signature verification
    pub token: String,

    /// WeChat AppID (also the receiver id inside encrypted payloads)
    pub app_id: String,

    /// WeChat AppSecret (for access tokens in active mode)
    #[serde(default)]
    pub app_secret: String,

    /// WeChat EncodingAESKey (43 characters, optional for plain mode)
    #[serde(default)]
    pub encoding_aes_key: Option<String>,

    /// Reply inline in the webhook response instead of pushing via the API
    #[serde(default = "default_passive_response_mode")]
    pub passive_response_mode: bool,
}

fn default_passive_response_mode() -> bool {
    true
}

impl Settings {
    /// Check the settings before they are used for a turn.
    ///
    /// `has_queue` tells whether a background queue is available for active mode.
    pub fn validate(&self, has_queue: bool) -> Result<(), AdapterError> {
        if self.token.trim().is_empty() {
            return Err(AdapterError::Configuration(
                "WeChat token is required".to_string(),
            ));
        }

        if self.app_id.trim().is_empty() {
            return Err(AdapterError::Configuration(
                "WeChat AppID is required".to_string(),
            ));
        }

        // Checks length and base64 so a bad key fails here, not on the first message
        if let Some(key) = &self.encoding_aes_key {
            WechatCrypto::new(key, &self.app_id)?;
        }

        if !self.passive_response_mode {
            if self.app_secret.trim().is_empty() {
                return Err(AdapterError::Configuration(
                    "WeChat AppSecret is required in active response mode".to_string(),
                ));
            }
            if !has_queue {
                return Err(AdapterError::Configuration(
                    "A background queue is required in active response mode".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Hosting configuration for the webhook binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub settings: Settings,

    /// Webhook server bind address (receives from WeChat)
    #[serde(default = "default_webhook_addr")]
    pub webhook_addr: String,

    /// Enable debug mode (log raw messages)
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_webhook_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let token = std::env::var("WECHAT_TOKEN").context("WECHAT_TOKEN is required")?;
        let app_id = std::env::var("WECHAT_APP_ID").context("WECHAT_APP_ID is required")?;

        let settings = Settings {
            token,
            app_id,
            app_secret: std::env::var("WECHAT_APP_SECRET").unwrap_or_default(),
            encoding_aes_key: std::env::var("WECHAT_ENCODING_AES_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            passive_response_mode: std::env::var("WECHAT_PASSIVE_RESPONSE")
                .map(|v| parse_flag(&v))
                .unwrap_or_else(|_| default_passive_response_mode()),
        };

        Ok(Self {
            settings,
            webhook_addr: std::env::var("WEBHOOK_ADDR").unwrap_or_else(|_| default_webhook_addr()),
            debug_mode: std::env::var("DEBUG_MODE").is_ok(),
        })
    }
}
