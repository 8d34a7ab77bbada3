//! Outbound WeChat messages and the passive XML reply format

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body WeChat accepts as "received, no reply"
pub const SUCCESS_BODY: &str = "success";

/// One article of a news message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub pic_url: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub content: String,
}

/// Clickable menu message (active mode only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMenu {
    pub head_content: String,
    pub items: Vec<MenuItem>,
    pub tail_content: String,
}

/// Every message kind the adapter can send back to WeChat
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    Text {
        content: String,
    },
    Image {
        media_id: String,
    },
    Voice {
        media_id: String,
    },
    Video {
        media_id: String,
        title: String,
        description: String,
    },
    Music {
        title: String,
        description: String,
        music_url: String,
        hq_music_url: String,
        thumb_media_id: String,
    },
    News {
        articles: Vec<Article>,
    },
    MpNews {
        media_id: String,
    },
    MessageMenu(MessageMenu),
    /// Channel data passed through untouched
    Raw(Value),
    Success,
    NoResponse,
}

impl ResponseMessage {
    /// WeChat's name for the message type
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::Video { .. } => "video",
            Self::Music { .. } => "music",
            Self::News { .. } => "news",
            Self::MpNews { .. } => "mpnews",
            Self::MessageMenu(_) => "msgmenu",
            Self::Raw(_) => "raw",
            Self::Success => "success",
            Self::NoResponse => "noresponse",
        }
    }
}

impl ResponseMessage {
    /// Whether [`to_xml`] can render this message as a passive reply
    pub fn has_passive_form(&self) -> bool {
        matches!(
            self,
            Self::Text { .. }
                | Self::Image { .. }
                | Self::Voice { .. }
                | Self::Video { .. }
                | Self::Music { .. }
                | Self::News { .. }
                | Self::Raw(Value::String(_))
        )
    }
}

/// Addressing for a passive reply: the reverse of the inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    /// End user's open id
    pub to_user_name: String,
    /// Official account id
    pub from_user_name: String,
    /// Epoch seconds
    pub create_time: i64,
}

/// Render a passive reply body.
///
/// Returns `None` for messages that have no passive XML form (menus, mpnews,
/// structured raw data, success and no-response markers). A raw string is
/// returned verbatim since it is expected to be a pre-rendered reply.
pub fn to_xml(header: &ReplyHeader, message: &ResponseMessage) -> Result<Option<String>> {
    let mut xml = XmlBuilder::new();

    let open = |xml: &mut XmlBuilder| -> Result<()> {
        xml.start("xml")?;
        xml.cdata_element("ToUserName", &header.to_user_name)?;
        xml.cdata_element("FromUserName", &header.from_user_name)?;
        xml.text_element("CreateTime", &header.create_time.to_string())?;
        xml.cdata_element("MsgType", message.msg_type())
    };

    match message {
        ResponseMessage::Text { content } => {
            open(&mut xml)?;
            xml.cdata_element("Content", content)?;
        }
        ResponseMessage::Image { media_id } => {
            open(&mut xml)?;
            xml.start("Image")?;
            xml.cdata_element("MediaId", media_id)?;
            xml.end("Image")?;
        }
        ResponseMessage::Voice { media_id } => {
            open(&mut xml)?;
            xml.start("Voice")?;
            xml.cdata_element("MediaId", media_id)?;
            xml.end("Voice")?;
        }
        ResponseMessage::Video {
            media_id,
            title,
            description,
        } => {
            open(&mut xml)?;
            xml.start("Video")?;
            xml.cdata_element("MediaId", media_id)?;
            xml.cdata_element("Title", title)?;
            xml.cdata_element("Description", description)?;
            xml.end("Video")?;
        }
        ResponseMessage::Music {
            title,
            description,
            music_url,
            hq_music_url,
            thumb_media_id,
        } => {
            open(&mut xml)?;
            xml.start("Music")?;
            xml.cdata_element("Title", title)?;
            xml.cdata_element("Description", description)?;
            xml.cdata_element("MusicUrl", music_url)?;
            xml.cdata_element("HQMusicUrl", hq_music_url)?;
            xml.cdata_element("ThumbMediaId", thumb_media_id)?;
            xml.end("Music")?;
        }
        ResponseMessage::News { articles } => {
            open(&mut xml)?;
            xml.text_element("ArticleCount", &articles.len().to_string())?;
            xml.start("Articles")?;
            for article in articles {
                xml.start("item")?;
                xml.cdata_element("Title", &article.title)?;
                xml.cdata_element("Description", &article.description)?;
                xml.cdata_element("PicUrl", &article.pic_url)?;
                xml.cdata_element("Url", &article.url)?;
                xml.end("item")?;
            }
            xml.end("Articles")?;
        }
        ResponseMessage::Raw(Value::String(raw)) => return Ok(Some(raw.clone())),
        ResponseMessage::Raw(_)
        | ResponseMessage::MpNews { .. }
        | ResponseMessage::MessageMenu(_)
        | ResponseMessage::Success
        | ResponseMessage::NoResponse => return Ok(None),
    }

    xml.end("xml")?;
    Ok(Some(xml.finish()))
}

/// Encrypted passive reply envelope
pub fn encrypted_envelope(
    encrypt: &str,
    signature: &str,
    timestamp: &str,
    nonce: &str,
) -> Result<String> {
    let mut xml = XmlBuilder::new();
    xml.start("xml")?;
    xml.cdata_element("Encrypt", encrypt)?;
    xml.cdata_element("MsgSignature", signature)?;
    xml.text_element("TimeStamp", timestamp)?;
    xml.cdata_element("Nonce", nonce)?;
    xml.end("xml")?;
    Ok(xml.finish())
}

struct XmlBuilder {
    writer: Writer<Vec<u8>>,
}

impl XmlBuilder {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn start(&mut self, name: &str) -> Result<()> {
        self.writer.write_event(Event::Start(BytesStart::new(name)))?;
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn text_element(&mut self, name: &str, value: &str) -> Result<()> {
        self.start(name)?;
        self.writer.write_event(Event::Text(BytesText::new(value)))?;
        self.end(name)
    }

    /// `]]>` cannot appear inside a CDATA section, so it is split across two
    fn cdata_element(&mut self, name: &str, value: &str) -> Result<()> {
        self.start(name)?;
        let mut parts = value.split("]]>").peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_some() {
                self.writer
                    .write_event(Event::CData(BytesCData::new(format!("{}]]", part))))?;
                self.writer.write_event(Event::CData(BytesCData::new(">")))?;
            } else {
                self.writer.write_event(Event::CData(BytesCData::new(part)))?;
            }
        }
        self.end(name)
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner()).into_owned()
    }
}
