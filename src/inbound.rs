//! Inbound mapping: WeChat request message to framework activity

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use crate::activity::{
    Activity, Attachment, CHANNEL_ID, ChannelAccount, ConversationAccount, activity_types,
    content_types,
};
use crate::request::{RequestMessage, RequestPayload};

/// Convert a parsed request into the activity handed to the bot.
///
/// `from.id` is always the sender's open id; outbound replies are routed by it.
pub fn to_activity(request: &RequestMessage) -> Activity {
    let header = &request.header;

    let mut activity = Activity {
        activity_type: activity_types::MESSAGE.to_string(),
        id: Some(
            header
                .msg_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ),
        timestamp: Some(timestamp_from(header.create_time)),
        channel_id: CHANNEL_ID.to_string(),
        from: ChannelAccount::new(&header.from_user_name),
        recipient: ChannelAccount::new(&header.to_user_name),
        conversation: ConversationAccount {
            id: header.from_user_name.clone(),
        },
        channel_data: serde_json::to_value(request).ok(),
        ..Default::default()
    };

    match &request.payload {
        RequestPayload::Text { content } => {
            activity.text = Some(content.clone());
        }
        RequestPayload::Image { pic_url, media_id } => {
            activity.attachments.push(Attachment {
                content_type: "image/*".to_string(),
                content_url: non_empty(pic_url),
                content: Some(json!({ "mediaId": media_id })),
                ..Default::default()
            });
        }
        RequestPayload::Voice {
            media_id,
            format,
            recognition,
        } => {
            activity.text = recognition.clone();
            activity.attachments.push(Attachment {
                content_type: format!("audio/{}", format_or(format, "*")),
                content: Some(json!({ "mediaId": media_id, "format": format })),
                ..Default::default()
            });
        }
        RequestPayload::Video {
            media_id,
            thumb_media_id,
            ..
        } => {
            activity.attachments.push(Attachment {
                content_type: "video/*".to_string(),
                content: Some(json!({
                    "mediaId": media_id,
                    "thumbMediaId": thumb_media_id,
                })),
                ..Default::default()
            });
        }
        RequestPayload::Location {
            latitude,
            longitude,
            scale,
            label,
        } => {
            activity.attachments.push(Attachment {
                content_type: content_types::WECHAT_LOCATION.to_string(),
                name: non_empty(label),
                content: Some(json!({
                    "latitude": latitude,
                    "longitude": longitude,
                    "scale": scale,
                    "label": label,
                })),
                ..Default::default()
            });
        }
        RequestPayload::Link {
            title,
            description,
            url,
        } => {
            activity.attachments.push(Attachment {
                content_type: content_types::WECHAT_LINK.to_string(),
                content_url: non_empty(url),
                name: non_empty(title),
                content: Some(json!({
                    "title": title,
                    "description": description,
                    "url": url,
                })),
                ..Default::default()
            });
        }
        RequestPayload::Event {
            event, event_key, ..
        } => {
            activity.activity_type = activity_types::EVENT.to_string();
            activity.name = event_key.clone().or_else(|| Some(event.clone()));
            activity.value = Some(Value::String(event.clone()));
        }
        RequestPayload::Unknown { raw_type, .. } => {
            debug!(
                "Mapping unsupported '{}' message from {} with raw channel data only",
                raw_type, header.from_user_name
            );
        }
    }

    activity
}

fn timestamp_from(create_time: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(create_time, 0).unwrap_or_else(Utc::now)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn format_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}
