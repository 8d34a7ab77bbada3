//! Bot framework activity model
//!
//! Only the subset of the activity schema that the WeChat channel reads or
//! writes is modelled here. Field names follow the framework's JSON casing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel id stamped on every activity produced by this adapter
pub const CHANNEL_ID: &str = "wechat";

/// Activity types used by the adapter
pub mod activity_types {
    pub const MESSAGE: &str = "message";
    pub const EVENT: &str = "event";
}

/// Content types with a dedicated WeChat mapping
pub mod content_types {
    pub const HERO_CARD: &str = "application/vnd.microsoft.card.hero";
    pub const THUMBNAIL_CARD: &str = "application/vnd.microsoft.card.thumbnail";
    pub const AUDIO_CARD: &str = "application/vnd.microsoft.card.audio";
    pub const WECHAT_MUSIC: &str = "application/vnd.wechat.music";
    pub const WECHAT_MPNEWS: &str = "application/vnd.wechat.mpnews";
    pub const WECHAT_LOCATION: &str = "application/vnd.wechat.location";
    pub const WECHAT_LINK: &str = "application/vnd.wechat.link";
}

/// A user or bot account on the channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
}

/// File or rich-card content attached to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl Attachment {
    /// WeChat media id carried in `content.mediaId`, if any
    pub fn media_id(&self) -> Option<&str> {
        self.content
            .as_ref()
            .and_then(|c| c.get("mediaId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// String field of the attachment content
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content
            .as_ref()
            .and_then(|c| c.get(key))
            .and_then(Value::as_str)
    }
}

/// A button offered to the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardAction {
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedActions {
    #[serde(default)]
    pub actions: Vec<CardAction>,
}

/// Enough of an activity to resume the conversation later
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    pub user: ChannelAccount,
    pub bot: ChannelAccount,
    pub conversation: ConversationAccount,
    pub channel_id: String,
}

/// The framework's unit of conversational exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub from: ChannelAccount,
    #[serde(default)]
    pub recipient: ChannelAccount,
    #[serde(default)]
    pub conversation: ConversationAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<SuggestedActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl Activity {
    /// Plain text message
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            activity_type: activity_types::MESSAGE.to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Message carrying attachments only
    pub fn attachments(attachments: Vec<Attachment>) -> Self {
        Self {
            activity_type: activity_types::MESSAGE.to_string(),
            attachments,
            ..Default::default()
        }
    }

    /// Message whose channel data is already WeChat-shaped
    pub fn channel_data(data: Value) -> Self {
        Self {
            activity_type: activity_types::MESSAGE.to_string(),
            channel_data: Some(data),
            ..Default::default()
        }
    }

    pub fn is_message(&self) -> bool {
        self.activity_type == activity_types::MESSAGE
    }

    /// Non-empty text, if any
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Reference for routing replies back to this conversation
    pub fn conversation_reference(&self) -> ConversationReference {
        ConversationReference {
            activity_id: self.id.clone(),
            user: self.from.clone(),
            bot: self.recipient.clone(),
            conversation: self.conversation.clone(),
            channel_id: self.channel_id.clone(),
        }
    }

    /// Address an outgoing activity as a reply within `reference`
    pub fn apply_conversation_reference(&mut self, reference: &ConversationReference) {
        self.channel_id = reference.channel_id.clone();
        self.from = reference.bot.clone();
        self.recipient = reference.user.clone();
        self.conversation = reference.conversation.clone();
        if self.reply_to_id.is_none() {
            self.reply_to_id = reference.activity_id.clone();
        }
    }

    /// Event used to resume a conversation outside a webhook turn
    pub fn continuation(reference: &ConversationReference) -> Self {
        Self {
            activity_type: activity_types::EVENT.to_string(),
            name: Some("ContinueConversation".to_string()),
            id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now()),
            channel_id: reference.channel_id.clone(),
            from: reference.user.clone(),
            recipient: reference.bot.clone(),
            conversation: reference.conversation.clone(),
            ..Default::default()
        }
    }
}
