//! Delivery of mapped responses, passive (XML body) or active (API calls)

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::WechatCrypto;
use crate::error::{AdapterError, Result};
use crate::response::{self, ReplyHeader, ResponseMessage, SUCCESS_BODY};
use crate::wechat_api::WechatClient;

/// Material for encrypting a passive reply in safe mode
pub struct ReplyEncryption<'a> {
    pub crypto: &'a WechatCrypto,
    pub token: &'a str,
    pub timestamp: &'a str,
    pub nonce: &'a str,
}

/// Render the passive reply body for one message.
///
/// Messages without a passive form are acknowledged with `success` so WeChat
/// does not retry or show the user a service error.
pub fn passive_body(
    header: &ReplyHeader,
    message: &ResponseMessage,
    encryption: Option<&ReplyEncryption<'_>>,
) -> Result<String> {
    let xml = response::to_xml(header, message)
        .map_err(|e| AdapterError::Reply(format!("Failed to render reply XML: {}", e)))?;

    let Some(xml) = xml else {
        if !matches!(message, ResponseMessage::Success | ResponseMessage::NoResponse) {
            warn!(
                "{} message cannot be sent as a passive reply, acknowledging only",
                message.msg_type()
            );
        }
        return Ok(SUCCESS_BODY.to_string());
    };

    match encryption {
        Some(enc) => {
            let encrypted = enc.crypto.encrypt(&xml)?;
            let signature =
                WechatCrypto::sign_message(enc.token, enc.timestamp, enc.nonce, &encrypted);
            response::encrypted_envelope(&encrypted, &signature, enc.timestamp, enc.nonce).map_err(
                |e| AdapterError::Reply(format!("Failed to render reply envelope: {}", e)),
            )
        }
        None => Ok(xml),
    }
}

/// Push every message to the user through the outbound client, in order.
///
/// The first failure is logged and returned; later messages are not sent.
/// Cancellation is checked between messages.
pub async fn deliver(
    client: &dyn WechatClient,
    open_id: &str,
    messages: &[ResponseMessage],
    cancel: &CancellationToken,
) -> Result<()> {
    for message in messages {
        if cancel.is_cancelled() {
            info!("Delivery to {} cancelled", open_id);
            return Err(AdapterError::Cancelled);
        }

        if let Err(source) = send_one(client, open_id, message).await {
            error!(
                "Failed to send {} message to {}: {:#}",
                message.msg_type(),
                open_id,
                source
            );
            return Err(AdapterError::Delivery {
                open_id: open_id.to_string(),
                msg_type: message.msg_type(),
                source,
            });
        }
    }

    Ok(())
}

async fn send_one(
    client: &dyn WechatClient,
    open_id: &str,
    message: &ResponseMessage,
) -> anyhow::Result<()> {
    match message {
        ResponseMessage::Text { content } => client.send_text(open_id, content).await,
        ResponseMessage::Image { media_id } => client.send_image(open_id, media_id).await,
        ResponseMessage::Voice { media_id } => client.send_voice(open_id, media_id).await,
        ResponseMessage::Video {
            media_id,
            title,
            description,
        } => client.send_video(open_id, media_id, title, description).await,
        ResponseMessage::Music {
            title,
            description,
            music_url,
            hq_music_url,
            thumb_media_id,
        } => {
            client
                .send_music(
                    open_id,
                    title,
                    description,
                    music_url,
                    hq_music_url,
                    thumb_media_id,
                )
                .await
        }
        ResponseMessage::News { articles } => client.send_news(open_id, articles).await,
        ResponseMessage::MpNews { media_id } => client.send_mpnews(open_id, media_id).await,
        ResponseMessage::MessageMenu(menu) => client.send_menu(open_id, menu).await,
        ResponseMessage::Raw(payload) => client.send_raw(open_id, payload).await,
        ResponseMessage::Success | ResponseMessage::NoResponse => {
            debug!("Nothing to send for {} marker", message.msg_type());
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::response::{Article, MessageMenu};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    /// Records every call as `"<kind>:<open_id>:<detail>"`
    #[derive(Default)]
    pub(crate) struct RecordingClient {
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Option<&'static str>,
    }

    impl RecordingClient {
        fn record(&self, kind: &'static str, open_id: &str, detail: &str) -> anyhow::Result<()> {
            if self.fail_on == Some(kind) {
                return Err(anyhow!("{} rejected", kind));
            }
            self.calls.lock().push(format!("{}:{}:{}", kind, open_id, detail));
            Ok(())
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WechatClient for RecordingClient {
        async fn send_text(&self, open_id: &str, content: &str) -> anyhow::Result<()> {
            self.record("text", open_id, content)
        }
        async fn send_image(&self, open_id: &str, media_id: &str) -> anyhow::Result<()> {
            self.record("image", open_id, media_id)
        }
        async fn send_voice(&self, open_id: &str, media_id: &str) -> anyhow::Result<()> {
            self.record("voice", open_id, media_id)
        }
        async fn send_video(
            &self,
            open_id: &str,
            media_id: &str,
            _title: &str,
            _description: &str,
        ) -> anyhow::Result<()> {
            self.record("video", open_id, media_id)
        }
        async fn send_music(
            &self,
            open_id: &str,
            title: &str,
            _description: &str,
            _music_url: &str,
            _hq_music_url: &str,
            _thumb_media_id: &str,
        ) -> anyhow::Result<()> {
            self.record("music", open_id, title)
        }
        async fn send_news(&self, open_id: &str, articles: &[Article]) -> anyhow::Result<()> {
            self.record("news", open_id, &articles.len().to_string())
        }
        async fn send_mpnews(&self, open_id: &str, media_id: &str) -> anyhow::Result<()> {
            self.record("mpnews", open_id, media_id)
        }
        async fn send_menu(&self, open_id: &str, menu: &MessageMenu) -> anyhow::Result<()> {
            self.record("menu", open_id, &menu.head_content)
        }
        async fn send_raw(&self, open_id: &str, payload: &Value) -> anyhow::Result<()> {
            self.record("raw", open_id, &payload.to_string())
        }
    }

    fn header() -> ReplyHeader {
        ReplyHeader {
            to_user_name: "user123".to_string(),
            from_user_name: "gh_bot".to_string(),
            create_time: 1,
        }
    }

    fn text(content: &str) -> ResponseMessage {
        ResponseMessage::Text {
            content: content.to_string(),
        }
    }

    #[test]
    fn test_passive_body_plain() {
        let body = passive_body(&header(), &text("hi"), None).unwrap();
        assert!(body.starts_with("<xml><ToUserName><![CDATA[user123]]></ToUserName>"));
        assert!(body.contains("<Content><![CDATA[hi]]></Content>"));
    }

    #[test]
    fn test_passive_body_without_xml_form_acknowledges() {
        let menu = ResponseMessage::MessageMenu(MessageMenu::default());
        assert_eq!(passive_body(&header(), &menu, None).unwrap(), "success");
        assert_eq!(
            passive_body(&header(), &ResponseMessage::NoResponse, None).unwrap(),
            "success"
        );
    }

    #[test]
    fn test_passive_body_encrypted() {
        let key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD_NO_PAD,
            [0x22u8; 32],
        );
        let crypto = WechatCrypto::new(&key, "wx_app").unwrap();
        let encryption = ReplyEncryption {
            crypto: &crypto,
            token: "token",
            timestamp: "1409304348",
            nonce: "nonce",
        };

        let body = passive_body(&header(), &text("secret"), Some(&encryption)).unwrap();
        let fields = crate::request::parse_fields(&body).map_err(|(_, e)| e).unwrap();

        let encrypted = &fields["Encrypt"];
        assert!(WechatCrypto::verify_message(
            "token",
            "1409304348",
            "nonce",
            encrypted,
            &fields["MsgSignature"]
        ));
        assert_eq!(fields["TimeStamp"], "1409304348");
        assert!(crypto.decrypt(encrypted).unwrap().contains("<![CDATA[secret]]>"));
    }

    #[tokio::test]
    async fn test_deliver_dispatches_each_kind() {
        let client = RecordingClient::default();
        let messages = vec![
            text("hi"),
            ResponseMessage::Image {
                media_id: "m1".to_string(),
            },
            ResponseMessage::News {
                articles: vec![Article::default()],
            },
            ResponseMessage::NoResponse,
            ResponseMessage::Raw(json!({ "msgtype": "x" })),
        ];

        deliver(&client, "user123", &messages, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            client.calls(),
            vec![
                "text:user123:hi",
                "image:user123:m1",
                "news:user123:1",
                r#"raw:user123:{"msgtype":"x"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_delivery_failure_aborts_batch() {
        let client = RecordingClient {
            fail_on: Some("image"),
            ..Default::default()
        };
        let messages = vec![
            text("first"),
            ResponseMessage::Image {
                media_id: "m".to_string(),
            },
            text("never"),
        ];

        let err = deliver(&client, "user123", &messages, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AdapterError::Delivery {
                msg_type: "image",
                ..
            }
        ));
        assert_eq!(client.calls(), vec!["text:user123:first"]);
    }

    #[tokio::test]
    async fn test_cancelled_delivery_sends_nothing() {
        let client = RecordingClient::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = deliver(&client, "user123", &[text("hi")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
        assert!(client.calls().is_empty());
    }
}
