//! Turn runner: the adapter surface the hosting layer calls per webhook

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{Activity, ConversationReference};
use crate::config::Settings;
use crate::crypto::WechatCrypto;
use crate::dispatcher::{self, ReplyEncryption};
use crate::error::{AdapterError, Result};
use crate::inbound;
use crate::outbound;
use crate::queue::BackgroundQueue;
use crate::request::{self, RequestMessage};
use crate::response::{ReplyHeader, ResponseMessage, SUCCESS_BODY};
use crate::types::{EncryptedMessage, SecretInfo};
use crate::wechat_api::WechatClient;

/// State of a single turn, handed to the bot
pub struct TurnContext {
    activity: Activity,
    responses: Vec<Activity>,
    cancellation: CancellationToken,
}

impl TurnContext {
    pub fn new(activity: Activity, cancellation: CancellationToken) -> Self {
        Self {
            activity,
            responses: Vec::new(),
            cancellation,
        }
    }

    /// The inbound activity
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Queue an outgoing activity, addressed as a reply to the inbound one
    pub fn send_activity(&mut self, mut activity: Activity) {
        activity.apply_conversation_reference(&self.activity.conversation_reference());
        self.responses.push(activity);
    }

    pub fn send_text(&mut self, text: impl Into<String>) {
        self.send_activity(Activity::message(text));
    }

    /// Outgoing activities collected so far
    pub fn responses(&self) -> &[Activity] {
        &self.responses
    }

    pub fn into_responses(self) -> Vec<Activity> {
        self.responses
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Bot logic invoked once per turn
#[async_trait]
pub trait Bot: Send + Sync {
    async fn on_turn(&self, ctx: &mut TurnContext) -> anyhow::Result<()>;
}

/// Receives errors raised by [`Bot::on_turn`]. The turn then completes normally.
#[async_trait]
pub trait TurnErrorHandler: Send + Sync {
    async fn on_turn_error(&self, ctx: &mut TurnContext, error: &anyhow::Error);
}

/// Bridges WeChat webhooks and a [`Bot`]
pub struct WechatAdapter {
    client: Arc<dyn WechatClient>,
    queue: Option<Arc<dyn BackgroundQueue>>,
    on_turn_error: Option<Arc<dyn TurnErrorHandler>>,
}

impl WechatAdapter {
    pub fn new(client: Arc<dyn WechatClient>) -> Self {
        Self {
            client,
            queue: None,
            on_turn_error: None,
        }
    }

    /// Queue used for active-mode delivery
    pub fn with_queue(mut self, queue: Arc<dyn BackgroundQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_turn_error_handler(mut self, handler: Arc<dyn TurnErrorHandler>) -> Self {
        self.on_turn_error = Some(handler);
        self
    }

    /// Process one webhook request and return the HTTP response body.
    ///
    /// Verification requests return the echo string. Message requests return
    /// the passive reply XML, or `success` when replies are pushed through the
    /// API or there is nothing to say.
    pub async fn process(
        &self,
        body: &str,
        secret: &SecretInfo,
        settings: &Settings,
        bot: &dyn Bot,
        cancel: CancellationToken,
    ) -> Result<String> {
        if !WechatCrypto::verify(
            &settings.token,
            &secret.timestamp,
            &secret.nonce,
            &secret.webhook_signature,
        ) {
            warn!("Invalid webhook signature, rejecting request");
            return Err(AdapterError::Authentication(
                "webhook signature mismatch".to_string(),
            ));
        }

        if let Some(echo) = secret.echo() {
            info!("Webhook verification successful");
            return Ok(echo.to_string());
        }

        if let Err(e) = settings.validate(self.queue.is_some()) {
            error!("{}", e);
            return Err(e);
        }

        let (xml, crypto) = open_envelope(body, secret, settings)?;
        let request = RequestMessage::parse(&xml);
        info!(
            "Received {} message from user {}",
            request.msg_type(),
            request.header.from_user_name
        );

        let activity = inbound::to_activity(&request);
        let mut ctx = TurnContext::new(activity, cancel.clone());
        self.run_turn(bot, &mut ctx).await?;
        let activities = ctx.into_responses();

        if settings.passive_response_mode {
            let header = ReplyHeader {
                to_user_name: request.header.from_user_name.clone(),
                from_user_name: request.header.to_user_name.clone(),
                create_time: Utc::now().timestamp(),
            };
            let encryption = crypto.as_ref().map(|crypto| ReplyEncryption {
                crypto,
                token: &settings.token,
                timestamp: &secret.timestamp,
                nonce: &secret.nonce,
            });
            return passive_reply(&header, &activities, encryption.as_ref());
        }

        self.enqueue_delivery(request.header.from_user_name, &activities, cancel)?;
        Ok(SUCCESS_BODY.to_string())
    }

    /// Run a bot-initiated turn for a stored conversation.
    ///
    /// There is no webhook response to carry a reply, so everything the bot
    /// sends is delivered through the API before this returns.
    pub async fn continue_conversation(
        &self,
        reference: &ConversationReference,
        settings: &Settings,
        bot: &dyn Bot,
        cancel: CancellationToken,
    ) -> Result<()> {
        if let Err(e) = settings.validate(self.queue.is_some()) {
            error!("{}", e);
            return Err(e);
        }

        let mut ctx = TurnContext::new(Activity::continuation(reference), cancel.clone());
        self.run_turn(bot, &mut ctx).await?;

        let messages = outbound::to_all_responses(ctx.responses());
        dispatcher::deliver(self.client.as_ref(), &reference.user.id, &messages, &cancel).await
    }

    async fn run_turn(&self, bot: &dyn Bot, ctx: &mut TurnContext) -> Result<()> {
        let Err(err) = bot.on_turn(ctx).await else {
            return Ok(());
        };

        error!("Bot turn failed: {:#}", err);
        match &self.on_turn_error {
            Some(handler) => {
                handler.on_turn_error(ctx, &err).await;
                Ok(())
            }
            None => Err(AdapterError::Turn(err)),
        }
    }

    fn enqueue_delivery(
        &self,
        open_id: String,
        activities: &[Activity],
        cancel: CancellationToken,
    ) -> Result<()> {
        let Some(queue) = &self.queue else {
            return Err(AdapterError::Configuration(
                "A background queue is required in active response mode".to_string(),
            ));
        };

        let messages = outbound::to_all_responses(activities);
        if messages.is_empty() {
            return Ok(());
        }

        debug!("Queueing {} message(s) for {}", messages.len(), open_id);
        let client = self.client.clone();
        queue.submit(Box::pin(async move {
            if let Err(e) = dispatcher::deliver(client.as_ref(), &open_id, &messages, &cancel).await
            {
                warn!("Background delivery to {} stopped: {}", open_id, e);
            }
        }));

        Ok(())
    }
}

/// Decrypt the body when it is an encrypted envelope.
///
/// Returns the message XML plus the cipher to encrypt the reply with, if the
/// request was encrypted.
fn open_envelope(
    body: &str,
    secret: &SecretInfo,
    settings: &Settings,
) -> Result<(String, Option<WechatCrypto>)> {
    let key = secret
        .encoding_aes_key
        .as_deref()
        .or(settings.encoding_aes_key.as_deref());

    let envelope = match serde_xml_rs::from_str::<EncryptedMessage>(body) {
        Ok(envelope) => envelope,
        Err(e) if has_encrypt_element(body) => {
            error!("Failed to parse message envelope: {}", e);
            return Err(AdapterError::Parse(e.to_string()));
        }
        // Not an envelope: the request parser degrades malformed XML on its own
        Err(_) => return Ok((body.to_string(), None)),
    };

    let Some(encrypted) = envelope.encrypt.filter(|e| !e.trim().is_empty()) else {
        return Ok((body.to_string(), None));
    };

    let Some(key) = key else {
        error!("Received encrypted message but no EncodingAESKey is configured");
        return Err(AdapterError::Configuration(
            "EncodingAESKey is required for encrypted messages".to_string(),
        ));
    };

    if let Some(msg_signature) = &secret.msg_signature
        && !WechatCrypto::verify_message(
            &settings.token,
            &secret.timestamp,
            &secret.nonce,
            &encrypted,
            msg_signature,
        )
    {
        warn!("Invalid message signature, rejecting request");
        return Err(AdapterError::Authentication(
            "message signature mismatch".to_string(),
        ));
    }

    let crypto = WechatCrypto::new(key, &settings.app_id)?;
    let xml = crypto.decrypt(&encrypted).inspect_err(|e| error!("{}", e))?;
    Ok((xml, Some(crypto)))
}

fn has_encrypt_element(body: &str) -> bool {
    match request::parse_fields(body) {
        Ok(fields) | Err((fields, _)) => fields.contains_key("Encrypt"),
    }
}

/// WeChat accepts a single passive reply, so only the last activity counts
fn passive_reply(
    header: &ReplyHeader,
    activities: &[Activity],
    encryption: Option<&ReplyEncryption<'_>>,
) -> Result<String> {
    let Some(last) = activities.last() else {
        return Ok(SUCCESS_BODY.to_string());
    };

    if activities.len() > 1 {
        debug!(
            "Passive reply keeps the last of {} activities",
            activities.len()
        );
    }

    // First message that renders; otherwise the first one, acknowledged as `success`
    let responses = outbound::to_responses(last);
    let message = responses
        .iter()
        .cloned()
        .map(outbound::to_passive)
        .find(ResponseMessage::has_passive_form)
        .or_else(|| responses.into_iter().next())
        .unwrap_or(ResponseMessage::NoResponse);
    dispatcher::passive_body(header, &message, encryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::RecordingClient;
    use crate::queue::SerialWorkQueue;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TOKEN: &str = "token";
    const APP_ID: &str = "wx_app";

    fn settings(passive: bool) -> Settings {
        Settings {
            token: TOKEN.to_string(),
            app_id: APP_ID.to_string(),
            app_secret: "secret".to_string(),
            encoding_aes_key: None,
            passive_response_mode: passive,
        }
    }

    fn secret() -> SecretInfo {
        SecretInfo {
            webhook_signature: WechatCrypto::sign(TOKEN, "1409304348", "nonce"),
            timestamp: "1409304348".to_string(),
            nonce: "nonce".to_string(),
            ..Default::default()
        }
    }

    fn text_request(content: &str) -> String {
        format!(
            "<xml><ToUserName><![CDATA[gh_bot]]></ToUserName>\
             <FromUserName><![CDATA[user123]]></FromUserName>\
             <CreateTime>1348831860</CreateTime>\
             <MsgType><![CDATA[text]]></MsgType>\
             <Content><![CDATA[{}]]></Content>\
             <MsgId>1234567890123456</MsgId></xml>",
            content
        )
    }

    fn aes_key() -> String {
        base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD_NO_PAD,
            [0x5au8; 32],
        )
    }

    /// Replies with each scripted activity, in order
    struct ScriptedBot {
        replies: Vec<Activity>,
        called: AtomicBool,
    }

    impl ScriptedBot {
        fn new(replies: Vec<Activity>) -> Self {
            Self {
                replies,
                called: AtomicBool::new(false),
            }
        }

        fn called(&self) -> bool {
            self.called.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Bot for ScriptedBot {
        async fn on_turn(&self, ctx: &mut TurnContext) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            for reply in &self.replies {
                ctx.send_activity(reply.clone());
            }
            Ok(())
        }
    }

    struct EchoBot;

    #[async_trait]
    impl Bot for EchoBot {
        async fn on_turn(&self, ctx: &mut TurnContext) -> anyhow::Result<()> {
            if let Some(text) = ctx.activity().text() {
                let reply = format!("echo: {}", text);
                ctx.send_text(reply);
            }
            Ok(())
        }
    }

    struct FailingBot;

    #[async_trait]
    impl Bot for FailingBot {
        async fn on_turn(&self, _ctx: &mut TurnContext) -> anyhow::Result<()> {
            Err(anyhow!("boom"))
        }
    }

    struct ApologyHandler;

    #[async_trait]
    impl TurnErrorHandler for ApologyHandler {
        async fn on_turn_error(&self, ctx: &mut TurnContext, error: &anyhow::Error) {
            ctx.send_text(format!("sorry: {}", error));
        }
    }

    async fn run(
        adapter: &WechatAdapter,
        body: &str,
        secret: &SecretInfo,
        settings: &Settings,
        bot: &dyn Bot,
    ) -> Result<String> {
        adapter
            .process(body, secret, settings, bot, CancellationToken::new())
            .await
    }

    fn adapter() -> (WechatAdapter, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::default());
        (WechatAdapter::new(client.clone()), client)
    }

    #[tokio::test]
    async fn test_echo_returned_verbatim() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![]);
        let secret = SecretInfo {
            echo_string: Some("12345".to_string()),
            encoding_aes_key: Some(aes_key()),
            ..secret()
        };

        let body = run(&adapter, "not xml at all", &secret, &settings(true), &bot).await.unwrap();

        assert_eq!(body, "12345");
        assert!(!bot.called());
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_before_bot() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![Activity::message("hi")]);
        let secret = SecretInfo {
            webhook_signature: "0".repeat(40),
            ..secret()
        };

        let err = run(&adapter, &text_request("hello"), &secret, &settings(true), &bot)
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Authentication(_)));
        assert!(!bot.called());
    }

    #[tokio::test]
    async fn test_passive_reply_echoes_text() {
        let (adapter, client) = adapter();

        let body = run(&adapter, &text_request("hello"), &secret(), &settings(true), &EchoBot)
            .await
            .unwrap();

        assert!(body.starts_with("<xml><ToUserName><![CDATA[user123]]></ToUserName>"));
        assert!(body.contains("<FromUserName><![CDATA[gh_bot]]></FromUserName>"));
        assert!(body.contains("<Content><![CDATA[echo: hello]]></Content>"));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_passive_keeps_only_last_activity() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![
            Activity::message("first"),
            Activity::message("second"),
            Activity::message("third"),
        ]);

        let body = run(&adapter, &text_request("hello"), &secret(), &settings(true), &bot)
            .await
            .unwrap();

        assert!(body.contains("<Content><![CDATA[third]]></Content>"));
        assert!(!body.contains("first"));
        assert!(!body.contains("second"));
    }

    #[tokio::test]
    async fn test_passive_without_replies_acknowledges() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![]);

        let body = run(&adapter, &text_request("hello"), &secret(), &settings(true), &bot)
            .await
            .unwrap();
        assert_eq!(body, "success");
    }

    #[tokio::test]
    async fn test_active_without_queue_is_configuration_error() {
        let (adapter, client) = adapter();
        let bot = ScriptedBot::new(vec![Activity::message("hi")]);

        let err = run(&adapter, &text_request("hello"), &secret(), &settings(false), &bot)
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Configuration(_)));
        assert!(!bot.called());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_active_mode_acknowledges_then_delivers() {
        let client = Arc::new(RecordingClient::default());
        let (queue, worker) = SerialWorkQueue::start();
        let adapter = WechatAdapter::new(client.clone()).with_queue(Arc::new(queue));
        let bot = ScriptedBot::new(vec![
            Activity::message("one"),
            Activity::channel_data(json!({ "msgtype": "transfer" })),
        ]);

        let body = run(&adapter, &text_request("hello"), &secret(), &settings(false), &bot)
            .await
            .unwrap();
        assert_eq!(body, "success");

        drop(adapter);
        worker.await.unwrap();

        assert_eq!(
            client.calls(),
            vec![
                "text:user123:one".to_string(),
                r#"raw:user123:{"msgtype":"transfer"}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_turn_error_propagates_without_handler() {
        let (adapter, _) = adapter();

        let err = run(&adapter, &text_request("hello"), &secret(), &settings(true), &FailingBot)
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Turn(_)));
    }

    #[tokio::test]
    async fn test_turn_error_handler_completes_turn() {
        let (adapter, _) = adapter();
        let adapter = adapter.with_turn_error_handler(Arc::new(ApologyHandler));

        let body = run(&adapter, &text_request("hello"), &secret(), &settings(true), &FailingBot)
            .await
            .unwrap();

        assert!(body.contains("<Content><![CDATA[sorry: boom]]></Content>"));
    }

    fn encrypted_request(crypto: &WechatCrypto, plain: &str) -> (String, String) {
        let encrypted = crypto.encrypt(plain).unwrap();
        let msg_signature = WechatCrypto::sign_message(TOKEN, "1409304348", "nonce", &encrypted);
        let body = format!(
            "<xml><ToUserName><![CDATA[gh_bot]]></ToUserName>\
             <Encrypt><![CDATA[{}]]></Encrypt></xml>",
            encrypted
        );
        (body, msg_signature)
    }

    #[tokio::test]
    async fn test_encrypted_request_gets_encrypted_reply() {
        let (adapter, _) = adapter();
        let crypto = WechatCrypto::new(&aes_key(), APP_ID).unwrap();
        let (body, msg_signature) = encrypted_request(&crypto, &text_request("secret"));

        let settings = Settings {
            encoding_aes_key: Some(aes_key()),
            ..settings(true)
        };
        let secret = SecretInfo {
            encoding_aes_key: Some(aes_key()),
            msg_signature: Some(msg_signature),
            ..secret()
        };

        let reply = run(&adapter, &body, &secret, &settings, &EchoBot).await.unwrap();

        let envelope: EncryptedMessage = serde_xml_rs::from_str(&reply).unwrap();
        let decrypted = crypto.decrypt(&envelope.encrypt.unwrap()).unwrap();
        assert!(decrypted.contains("<Content><![CDATA[echo: secret]]></Content>"));
    }

    #[tokio::test]
    async fn test_bad_message_signature_rejected() {
        let (adapter, _) = adapter();
        let crypto = WechatCrypto::new(&aes_key(), APP_ID).unwrap();
        let (body, _) = encrypted_request(&crypto, &text_request("secret"));

        let settings = Settings {
            encoding_aes_key: Some(aes_key()),
            ..settings(true)
        };
        let secret = SecretInfo {
            encoding_aes_key: Some(aes_key()),
            msg_signature: Some("f".repeat(40)),
            ..secret()
        };

        let err = run(&adapter, &body, &secret, &settings, &EchoBot).await.unwrap_err();
        assert!(matches!(err, AdapterError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_encrypted_request_without_key() {
        let (adapter, _) = adapter();
        let crypto = WechatCrypto::new(&aes_key(), APP_ID).unwrap();
        let (body, _) = encrypted_request(&crypto, &text_request("secret"));

        let err = run(&adapter, &body, &secret(), &settings(true), &EchoBot).await.unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_malformed_plain_body_still_runs_turn() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![]);

        let body = run(&adapter, "<xml><MsgType>text", &secret(), &settings(true), &bot)
            .await
            .unwrap();

        assert_eq!(body, "success");
        assert!(bot.called());
    }

    #[tokio::test]
    async fn test_malformed_plain_body_with_key_still_runs_turn() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![]);
        let settings = Settings {
            encoding_aes_key: Some(aes_key()),
            ..settings(true)
        };
        let secret = SecretInfo {
            encoding_aes_key: Some(aes_key()),
            ..secret()
        };

        let body = run(&adapter, "<xml><MsgType>text", &secret, &settings, &bot)
            .await
            .unwrap();

        assert_eq!(body, "success");
        assert!(bot.called());
    }

    #[tokio::test]
    async fn test_unreadable_encrypted_envelope_rejected() {
        let (adapter, _) = adapter();
        let bot = ScriptedBot::new(vec![]);
        let settings = Settings {
            encoding_aes_key: Some(aes_key()),
            ..settings(true)
        };

        let err = run(
            &adapter,
            "<xml><Encrypt><![CDATA[abc]]></Encrypt></envelope>",
            &secret(),
            &settings,
            &bot,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AdapterError::Parse(_)));
        assert!(!bot.called());
    }

    #[tokio::test]
    async fn test_passive_suggested_actions_reply_as_text() {
        let (adapter, _) = adapter();
        let mut reply = Activity::message("Pick one");
        reply.suggested_actions = Some(crate::activity::SuggestedActions {
            actions: vec![crate::activity::CardAction {
                action_type: "imBack".to_string(),
                title: "Yes".to_string(),
                value: None,
            }],
        });
        let bot = ScriptedBot::new(vec![reply]);

        let body = run(&adapter, &text_request("hi"), &secret(), &settings(true), &bot)
            .await
            .unwrap();

        assert_ne!(body, "success");
        assert!(body.contains("<MsgType><![CDATA[text]]></MsgType>"));
        assert!(body.contains("<Content><![CDATA[Pick one\nYes]]></Content>"));
    }

    #[tokio::test]
    async fn test_continue_conversation_delivers_inline() {
        let (adapter, client) = adapter();
        let reference = ConversationReference {
            user: crate::activity::ChannelAccount::new("user123"),
            bot: crate::activity::ChannelAccount::new("gh_bot"),
            channel_id: crate::activity::CHANNEL_ID.to_string(),
            ..Default::default()
        };
        let bot = ScriptedBot::new(vec![Activity::message("reminder")]);

        adapter
            .continue_conversation(&reference, &settings(true), &bot, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.calls(), vec!["text:user123:reminder".to_string()]);
    }
}
