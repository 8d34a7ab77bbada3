//! WeChat Official Account adapter for bots
//!
//! Connects a bot to WeChat webhooks: verifies signatures, decrypts safe-mode
//! payloads, maps WeChat messages to activities and back, and delivers replies
//! either inline (passive mode) or through the customer service API (active mode).
//!
//! # Architecture
//!
//! ```text
//! WeChat ──HTTPS──▶ webhook ──▶ WechatAdapter::process ──▶ Bot::on_turn
//!                                  │
//!                                  ├── passive: XML reply body
//!                                  └── active: BackgroundQueue ──▶ WechatClient
//! ```
//!
//! # Usage
//!
//! ```bash
//! export WECHAT_TOKEN=your_token
//! export WECHAT_APP_ID=wx1234567890abcdef
//! export WECHAT_APP_SECRET=your_secret               # active mode only
//! export WECHAT_ENCODING_AES_KEY=your_43_char_key    # optional
//! export WECHAT_PASSIVE_RESPONSE=false               # default: passive
//!
//! wechat-bot-adapter
//! ```

pub mod activity;
pub mod adapter;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod queue;
pub mod request;
pub mod response;
pub mod types;
pub mod webhook;
pub mod wechat_api;

pub use adapter::{Bot, TurnContext, TurnErrorHandler, WechatAdapter};
pub use config::{ServerConfig, Settings};
pub use crypto::WechatCrypto;
pub use error::{AdapterError, Result};
pub use types::*;
pub use wechat_api::{WechatApiClient, WechatClient};

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::*;
    pub use crate::adapter::{Bot, TurnContext, TurnErrorHandler, WechatAdapter};
    pub use crate::config::{ServerConfig, Settings};
    pub use crate::crypto::WechatCrypto;
    pub use crate::error::AdapterError;
    pub use crate::queue::{BackgroundQueue, SerialWorkQueue, TokioSpawnQueue};
    pub use crate::types::*;
    pub use crate::wechat_api::{WechatApiClient, WechatClient};
}
