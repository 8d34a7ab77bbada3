//! WeChat API Client for Official Account
//!
//! Handles:
//! - Access Token management (auto-refresh before expiry)
//! - Customer service message sending (within 48h window)

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::response::{Article, MessageMenu};

// =============================================================================
// API Endpoints
// =============================================================================

const DEFAULT_API_BASE: &str = "https://api.weixin.qq.com";
const TOKEN_PATH: &str = "/cgi-bin/token";
const CUSTOM_SEND_PATH: &str = "/cgi-bin/message/custom/send";

// =============================================================================
// Outbound capability
// =============================================================================

/// Direct message delivery to a user, keyed by open id.
///
/// Every call reports failure as an error, including WeChat API errors
/// returned with HTTP 200.
#[async_trait]
pub trait WechatClient: Send + Sync {
    async fn send_text(&self, open_id: &str, content: &str) -> Result<()>;

    async fn send_image(&self, open_id: &str, media_id: &str) -> Result<()>;

    async fn send_voice(&self, open_id: &str, media_id: &str) -> Result<()>;

    async fn send_video(
        &self,
        open_id: &str,
        media_id: &str,
        title: &str,
        description: &str,
    ) -> Result<()>;

    async fn send_music(
        &self,
        open_id: &str,
        title: &str,
        description: &str,
        music_url: &str,
        hq_music_url: &str,
        thumb_media_id: &str,
    ) -> Result<()>;

    async fn send_news(&self, open_id: &str, articles: &[Article]) -> Result<()>;

    async fn send_mpnews(&self, open_id: &str, media_id: &str) -> Result<()>;

    async fn send_menu(&self, open_id: &str, menu: &MessageMenu) -> Result<()>;

    /// Send a pre-built custom message body as is
    async fn send_raw(&self, open_id: &str, payload: &Value) -> Result<()>;
}

// =============================================================================
// Access Token Management
// =============================================================================

/// Cached access token with expiry tracking
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn new(access_token: String, expires_in_secs: u64) -> Self {
        // Refresh 5 minutes before expiry to be safe
        let buffer_secs = 300;
        let effective_expiry = expires_in_secs.saturating_sub(buffer_secs);
        Self {
            access_token,
            expires_at: Instant::now() + Duration::from_secs(effective_expiry),
        }
    }

    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Token response from WeChat API
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    errcode: Option<i32>,
    #[serde(default)]
    errmsg: Option<String>,
}

// =============================================================================
// WeChat API Client
// =============================================================================

/// WeChat Official Account API client
#[derive(Clone)]
pub struct WechatApiClient {
    app_id: String,
    app_secret: String,
    base_url: String,
    http_client: Client,
    cached_token: Arc<RwLock<Option<CachedToken>>>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl WechatApiClient {
    /// Create a new WeChat API client
    pub fn new(app_id: String, app_secret: String) -> Self {
        Self::with_base_url(app_id, app_secret, DEFAULT_API_BASE)
    }

    /// Create a client against a custom API host (for testing with wiremock)
    pub fn with_base_url(app_id: String, app_secret: String, base_url: &str) -> Self {
        Self {
            app_id,
            app_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            cached_token: Arc::new(RwLock::new(None)),
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn cached_access_token(&self) -> Option<String> {
        let guard = self.cached_token.read();
        guard
            .as_ref()
            .filter(|token| token.is_valid())
            .map(|token| token.access_token.clone())
    }

    /// Get a valid access token (refreshes if expired)
    pub async fn get_access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_access_token() {
            debug!("Using cached access token");
            return Ok(token);
        }

        // Concurrent turns wait for a single refresh
        let _refresh = self.refresh_lock.lock().await;
        if let Some(token) = self.cached_access_token() {
            return Ok(token);
        }

        self.refresh_token().await
    }

    /// Force refresh the access token
    async fn refresh_token(&self) -> Result<String> {
        debug!("Refreshing WeChat access token");

        let url = format!("{}{}", self.base_url, TOKEN_PATH);

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await
            .context("Failed to send token request")?;

        let token_resp: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        if let Some(errcode) = token_resp.errcode
            && errcode != 0
        {
            let errmsg = token_resp.errmsg.clone().unwrap_or_default();
            error!("WeChat token error: {} - {}", errcode, errmsg);
            return Err(anyhow!("WeChat token error: {} - {}", errcode, errmsg));
        }

        let access_token = token_resp
            .access_token
            .ok_or_else(|| anyhow!("No access token in response"))?;
        let expires_in = token_resp.expires_in.unwrap_or(7200);

        {
            let mut guard = self.cached_token.write();
            *guard = Some(CachedToken::new(access_token.clone(), expires_in));
        }

        info!(
            "Successfully refreshed WeChat access token (expires in {}s)",
            expires_in
        );
        Ok(access_token)
    }

    /// Post a customer service message body
    async fn post_custom<T: Serialize + ?Sized>(&self, to_user: &str, request: &T) -> Result<()> {
        let access_token = self.get_access_token().await?;
        let api_url = format!("{}{}", self.base_url, CUSTOM_SEND_PATH);

        debug!("Sending custom message to user: {}", to_user);

        let response = self
            .http_client
            .post(&api_url)
            .query(&[("access_token", access_token.as_str())])
            .json(request)
            .send()
            .await
            .context("Failed to send custom message request")?;

        let result: CustomMessageResult = response
            .json()
            .await
            .context("Failed to parse custom message response")?;

        if result.errcode != 0 {
            warn!(
                "Custom message error: {} - {}",
                result.errcode, result.errmsg
            );
            return Err(anyhow!(
                "Custom message error: {} - {}",
                result.errcode,
                result.errmsg
            ));
        }

        info!("Custom message sent successfully to {}", to_user);
        Ok(())
    }

    async fn send_custom(&self, to_user: &str, payload: CustomPayload<'_>) -> Result<()> {
        let request = CustomMessageRequest {
            touser: to_user,
            msgtype: payload.msg_type(),
            payload,
        };
        self.post_custom(to_user, &request).await
    }
}

#[async_trait]
impl WechatClient for WechatApiClient {
    async fn send_text(&self, open_id: &str, content: &str) -> Result<()> {
        self.send_custom(open_id, CustomPayload::Text(TextMessageContent { content }))
            .await
    }

    async fn send_image(&self, open_id: &str, media_id: &str) -> Result<()> {
        self.send_custom(open_id, CustomPayload::Image(MediaContent { media_id }))
            .await
    }

    async fn send_voice(&self, open_id: &str, media_id: &str) -> Result<()> {
        self.send_custom(open_id, CustomPayload::Voice(MediaContent { media_id }))
            .await
    }

    async fn send_video(
        &self,
        open_id: &str,
        media_id: &str,
        title: &str,
        description: &str,
    ) -> Result<()> {
        self.send_custom(
            open_id,
            CustomPayload::Video(VideoContent {
                media_id,
                thumb_media_id: "",
                title,
                description,
            }),
        )
        .await
    }

    async fn send_music(
        &self,
        open_id: &str,
        title: &str,
        description: &str,
        music_url: &str,
        hq_music_url: &str,
        thumb_media_id: &str,
    ) -> Result<()> {
        self.send_custom(
            open_id,
            CustomPayload::Music(MusicContent {
                title,
                description,
                musicurl: music_url,
                hqmusicurl: hq_music_url,
                thumb_media_id,
            }),
        )
        .await
    }

    async fn send_news(&self, open_id: &str, articles: &[Article]) -> Result<()> {
        let articles = articles
            .iter()
            .map(|a| NewsArticle {
                title: &a.title,
                description: &a.description,
                url: &a.url,
                picurl: &a.pic_url,
            })
            .collect();
        self.send_custom(open_id, CustomPayload::News(NewsContent { articles }))
            .await
    }

    async fn send_mpnews(&self, open_id: &str, media_id: &str) -> Result<()> {
        self.send_custom(open_id, CustomPayload::Mpnews(MediaContent { media_id }))
            .await
    }

    async fn send_menu(&self, open_id: &str, menu: &MessageMenu) -> Result<()> {
        let list = menu
            .items
            .iter()
            .map(|item| MenuEntry {
                id: &item.id,
                content: &item.content,
            })
            .collect();
        self.send_custom(
            open_id,
            CustomPayload::Msgmenu(MenuContent {
                head_content: &menu.head_content,
                list,
                tail_content: &menu.tail_content,
            }),
        )
        .await
    }

    async fn send_raw(&self, open_id: &str, payload: &Value) -> Result<()> {
        let mut body = payload.clone();
        if let Value::Object(map) = &mut body {
            map.entry("touser")
                .or_insert_with(|| Value::String(open_id.to_string()));
        }
        self.post_custom(open_id, &body).await
    }
}

// =============================================================================
// Custom (Customer Service) Message Types
// =============================================================================

/// Custom message request: `{"touser", "msgtype", "<msgtype>": {...}}`
#[derive(Debug, Serialize)]
struct CustomMessageRequest<'a> {
    touser: &'a str,
    msgtype: &'static str,
    #[serde(flatten)]
    payload: CustomPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CustomPayload<'a> {
    Text(TextMessageContent<'a>),
    Image(MediaContent<'a>),
    Voice(MediaContent<'a>),
    Video(VideoContent<'a>),
    Music(MusicContent<'a>),
    News(NewsContent<'a>),
    Mpnews(MediaContent<'a>),
    Msgmenu(MenuContent<'a>),
}

impl CustomPayload<'_> {
    fn msg_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Voice(_) => "voice",
            Self::Video(_) => "video",
            Self::Music(_) => "music",
            Self::News(_) => "news",
            Self::Mpnews(_) => "mpnews",
            Self::Msgmenu(_) => "msgmenu",
        }
    }
}

/// Text message content
#[derive(Debug, Serialize)]
struct TextMessageContent<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MediaContent<'a> {
    media_id: &'a str,
}

#[derive(Debug, Serialize)]
struct VideoContent<'a> {
    media_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    thumb_media_id: &'a str,
    title: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct MusicContent<'a> {
    title: &'a str,
    description: &'a str,
    musicurl: &'a str,
    hqmusicurl: &'a str,
    thumb_media_id: &'a str,
}

#[derive(Debug, Serialize)]
struct NewsContent<'a> {
    articles: Vec<NewsArticle<'a>>,
}

#[derive(Debug, Serialize)]
struct NewsArticle<'a> {
    title: &'a str,
    description: &'a str,
    url: &'a str,
    picurl: &'a str,
}

#[derive(Debug, Serialize)]
struct MenuContent<'a> {
    head_content: &'a str,
    list: Vec<MenuEntry<'a>>,
    tail_content: &'a str,
}

#[derive(Debug, Serialize)]
struct MenuEntry<'a> {
    id: &'a str,
    content: &'a str,
}

/// Custom message send result
#[derive(Debug, Deserialize)]
pub struct CustomMessageResult {
    pub errcode: i32,
    #[serde(default)]
    pub errmsg: String,
}

// =============================================================================
// Tests
// =============================================================================
