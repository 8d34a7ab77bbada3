//! Outbound mapping: framework activity to WeChat response messages

use serde_json::Value;
use tracing::debug;

use crate::activity::{Activity, Attachment, CardAction, content_types};
use crate::response::{Article, MenuItem, MessageMenu, ResponseMessage};

/// WeChat rejects text messages longer than this many characters
pub const MAX_TEXT_LENGTH: usize = 2048;

/// Upper bound on articles in one news message
pub const MAX_NEWS_ARTICLES: usize = 8;

/// Map one outgoing activity to the messages that represent it, in order.
///
/// Channel data bypasses typed mapping entirely. Activities with nothing
/// WeChat can show map to a single [`ResponseMessage::NoResponse`].
pub fn to_responses(activity: &Activity) -> Vec<ResponseMessage> {
    if let Some(data) = &activity.channel_data {
        return vec![ResponseMessage::Raw(data.clone())];
    }

    if !activity.is_message() {
        debug!(
            "Activity type '{}' has no WeChat representation",
            activity.activity_type
        );
        return vec![ResponseMessage::NoResponse];
    }

    let mut responses = Vec::new();

    let actions = activity
        .suggested_actions
        .as_ref()
        .map(|s| s.actions.as_slice())
        .unwrap_or_default();

    if !actions.is_empty() {
        // Text becomes the menu head so it is not sent twice
        responses.push(ResponseMessage::MessageMenu(menu_from(
            activity.text().unwrap_or_default(),
            actions,
        )));
    } else if let Some(text) = activity.text() {
        responses.extend(
            split_text(text, MAX_TEXT_LENGTH)
                .into_iter()
                .map(|content| ResponseMessage::Text { content }),
        );
    }

    let mut last_was_news = false;
    for response in activity.attachments.iter().filter_map(attachment_to_response) {
        let is_news = matches!(response, ResponseMessage::News { .. });
        if let ResponseMessage::News { articles } = &response
            && last_was_news
            && let Some(ResponseMessage::News { articles: merged }) = responses.last_mut()
            && merged.len() + articles.len() <= MAX_NEWS_ARTICLES
        {
            merged.extend(articles.iter().cloned());
            continue;
        }
        responses.push(response);
        last_was_news = is_news;
    }

    if responses.is_empty() {
        responses.push(ResponseMessage::NoResponse);
    }

    responses
}

/// Map every activity of a turn, keeping activity order
pub fn to_all_responses(activities: &[Activity]) -> Vec<ResponseMessage> {
    activities.iter().flat_map(to_responses).collect()
}

/// Passive replies cannot carry a menu, so one is flattened to plain text
pub fn to_passive(message: ResponseMessage) -> ResponseMessage {
    let ResponseMessage::MessageMenu(menu) = message else {
        return message;
    };

    let text = std::iter::once(menu.head_content.as_str())
        .chain(menu.items.iter().map(|item| item.content.as_str()))
        .chain(std::iter::once(menu.tail_content.as_str()))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    match split_text(&text, MAX_TEXT_LENGTH).into_iter().next() {
        Some(content) if !content.is_empty() => ResponseMessage::Text { content },
        _ => ResponseMessage::NoResponse,
    }
}

fn menu_from(head: &str, actions: &[CardAction]) -> MessageMenu {
    MessageMenu {
        head_content: head.to_string(),
        items: actions
            .iter()
            .enumerate()
            .map(|(idx, action)| MenuItem {
                id: action_value(action).unwrap_or_else(|| (idx + 1).to_string()),
                content: action.title.clone(),
            })
            .collect(),
        tail_content: String::new(),
    }
}

fn action_value(action: &CardAction) -> Option<String> {
    match action.value.as_ref()? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn attachment_to_response(attachment: &Attachment) -> Option<ResponseMessage> {
    let content_type = attachment.content_type.to_ascii_lowercase();

    match content_type.as_str() {
        content_types::HERO_CARD | content_types::THUMBNAIL_CARD => {
            Some(ResponseMessage::News {
                articles: vec![card_article(attachment)],
            })
        }
        content_types::AUDIO_CARD => audio_card_music(attachment),
        content_types::WECHAT_MUSIC => Some(ResponseMessage::Music {
            title: content_string(attachment, "title"),
            description: content_string(attachment, "description"),
            music_url: content_string(attachment, "musicUrl"),
            hq_music_url: content_string(attachment, "hqMusicUrl"),
            thumb_media_id: content_string(attachment, "thumbMediaId"),
        }),
        content_types::WECHAT_MPNEWS => attachment
            .media_id()
            .map(|media_id| ResponseMessage::MpNews {
                media_id: media_id.to_string(),
            }),
        ct if ct.starts_with("image/") => media_or_link(attachment, |media_id| {
            ResponseMessage::Image { media_id }
        }),
        ct if ct.starts_with("audio/") => media_or_link(attachment, |media_id| {
            ResponseMessage::Voice { media_id }
        }),
        ct if ct.starts_with("video/") => media_or_link(attachment, |media_id| {
            ResponseMessage::Video {
                media_id,
                title: attachment.name.clone().unwrap_or_default(),
                description: content_string(attachment, "description"),
            }
        }),
        _ => {
            let link = link_article(attachment);
            if link.is_none() {
                debug!(
                    "Dropping attachment with unsupported content type '{}'",
                    attachment.content_type
                );
            }
            link
        }
    }
}

/// Uploaded media is sent as is; a bare URL degrades to a link article
fn media_or_link(
    attachment: &Attachment,
    build: impl FnOnce(String) -> ResponseMessage,
) -> Option<ResponseMessage> {
    match attachment.media_id() {
        Some(media_id) => Some(build(media_id.to_string())),
        None => link_article(attachment),
    }
}

fn link_article(attachment: &Attachment) -> Option<ResponseMessage> {
    let url = attachment.content_url.as_deref().filter(|u| !u.is_empty())?;
    let is_image = attachment.content_type.starts_with("image/");

    Some(ResponseMessage::News {
        articles: vec![Article {
            title: attachment.name.clone().unwrap_or_else(|| url.to_string()),
            description: String::new(),
            pic_url: if is_image {
                url.to_string()
            } else {
                attachment.thumbnail_url.clone().unwrap_or_default()
            },
            url: url.to_string(),
        }],
    })
}

fn card_article(attachment: &Attachment) -> Article {
    let content = attachment.content.as_ref();
    let get = |key: &str| {
        content
            .and_then(|c| c.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let subtitle = get("subtitle");
    let text = get("text");
    let description = match (subtitle.is_empty(), text.is_empty()) {
        (false, false) => format!("{}\n{}", subtitle, text),
        (false, true) => subtitle,
        _ => text,
    };

    let pic_url = content
        .and_then(|c| c.pointer("/images/0/url"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Tap action first, then the first button that opens a URL
    let url = content
        .and_then(|c| c.pointer("/tap/value"))
        .and_then(Value::as_str)
        .or_else(|| {
            content
                .and_then(|c| c.get("buttons"))
                .and_then(Value::as_array)
                .and_then(|buttons| {
                    buttons
                        .iter()
                        .find(|b| b.get("type").and_then(Value::as_str) == Some("openUrl"))
                })
                .and_then(|b| b.get("value"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string();

    Article {
        title: get("title"),
        description,
        pic_url,
        url,
    }
}

fn audio_card_music(attachment: &Attachment) -> Option<ResponseMessage> {
    let content = attachment.content.as_ref()?;
    let music_url = content
        .pointer("/media/0/url")
        .and_then(Value::as_str)?
        .to_string();

    Some(ResponseMessage::Music {
        title: content_string(attachment, "title"),
        description: content_string(attachment, "subtitle"),
        hq_music_url: music_url.clone(),
        music_url,
        thumb_media_id: content_string(attachment, "thumbMediaId"),
    })
}

fn content_string(attachment: &Attachment, key: &str) -> String {
    attachment.content_str(key).unwrap_or_default().to_string()
}

/// Split text into chunks of at most `max_chars` characters, preferring line breaks
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let hard_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());

        let split_at = match rest[..hard_end].rfind('\n') {
            Some(idx) if idx > 0 => idx + 1,
            _ => hard_end,
        };

        chunks.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }

    chunks
}
