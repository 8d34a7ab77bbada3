//! Inbound WeChat messages
//!
//! The plaintext XML is first flattened into a field map, then the `MsgType`
//! element picks the typed payload. Anything unexpected becomes
//! [`RequestPayload::Unknown`] so the webhook handshake never fails on
//! message content WeChat adds later.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;
use tracing::{debug, warn};

/// Flattened element text keyed by path below the root (`Parent.Child` when nested)
pub type RawFields = BTreeMap<String, String>;

/// Fields shared by every inbound message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Official account id
    pub to_user_name: String,
    /// End user's open id
    pub from_user_name: String,
    /// Epoch seconds
    pub create_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<i64>,
}

/// Type-specific content of an inbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msgType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RequestPayload {
    Text {
        content: String,
    },
    Image {
        pic_url: String,
        media_id: String,
    },
    Voice {
        media_id: String,
        format: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        recognition: Option<String>,
    },
    Video {
        media_id: String,
        thumb_media_id: String,
        /// `shortvideo` messages
        is_short: bool,
    },
    Location {
        latitude: f64,
        longitude: f64,
        scale: u32,
        label: String,
    },
    Link {
        title: String,
        description: String,
        url: String,
    },
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ticket: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        latitude: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        longitude: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        precision: Option<f64>,
    },
    Unknown {
        raw_type: String,
        fields: RawFields,
    },
}

/// One parsed inbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(flatten)]
    pub payload: RequestPayload,
}

impl RequestMessage {
    /// Parse a decrypted XML document.
    ///
    /// Never fails: malformed XML or an unsupported `MsgType` yields an
    /// `Unknown` payload carrying whatever fields could be read.
    pub fn parse(xml: &str) -> Self {
        let fields = match parse_fields(xml) {
            Ok(fields) => fields,
            Err((partial, e)) => {
                warn!("Malformed message XML, degrading to unknown message: {}", e);
                return Self::unknown(partial);
            }
        };

        Self::from_fields(fields)
    }

    /// Build from an already flattened field map
    pub fn from_fields(fields: RawFields) -> Self {
        let header = header_from(&fields);
        let msg_type = field(&fields, "MsgType").to_ascii_lowercase();

        let payload = match msg_type.as_str() {
            "text" => RequestPayload::Text {
                content: field(&fields, "Content"),
            },
            "image" => RequestPayload::Image {
                pic_url: field(&fields, "PicUrl"),
                media_id: field(&fields, "MediaId"),
            },
            "voice" => RequestPayload::Voice {
                media_id: field(&fields, "MediaId"),
                format: field(&fields, "Format"),
                recognition: opt_field(&fields, "Recognition"),
            },
            "video" | "shortvideo" => RequestPayload::Video {
                media_id: field(&fields, "MediaId"),
                thumb_media_id: field(&fields, "ThumbMediaId"),
                is_short: msg_type == "shortvideo",
            },
            "location" => RequestPayload::Location {
                latitude: parse_num(&fields, "Location_X").unwrap_or_default(),
                longitude: parse_num(&fields, "Location_Y").unwrap_or_default(),
                scale: parse_num(&fields, "Scale").unwrap_or_default(),
                label: field(&fields, "Label"),
            },
            "link" => RequestPayload::Link {
                title: field(&fields, "Title"),
                description: field(&fields, "Description"),
                url: field(&fields, "Url"),
            },
            "event" if fields.contains_key("Event") => RequestPayload::Event {
                event: field(&fields, "Event"),
                event_key: opt_field(&fields, "EventKey"),
                ticket: opt_field(&fields, "Ticket"),
                latitude: parse_num(&fields, "Latitude"),
                longitude: parse_num(&fields, "Longitude"),
                precision: parse_num(&fields, "Precision"),
            },
            _ => {
                debug!("Unsupported message type '{}', keeping raw fields", msg_type);
                return Self::unknown(fields);
            }
        };

        Self { header, payload }
    }

    fn unknown(fields: RawFields) -> Self {
        Self {
            header: header_from(&fields),
            payload: RequestPayload::Unknown {
                raw_type: field(&fields, "MsgType"),
                fields,
            },
        }
    }

    /// WeChat's name for the message type
    pub fn msg_type(&self) -> &str {
        match &self.payload {
            RequestPayload::Text { .. } => "text",
            RequestPayload::Image { .. } => "image",
            RequestPayload::Voice { .. } => "voice",
            RequestPayload::Video { is_short: true, .. } => "shortvideo",
            RequestPayload::Video { .. } => "video",
            RequestPayload::Location { .. } => "location",
            RequestPayload::Link { .. } => "link",
            RequestPayload::Event { .. } => "event",
            RequestPayload::Unknown { raw_type, .. } => raw_type,
        }
    }
}

fn header_from(fields: &RawFields) -> MessageHeader {
    MessageHeader {
        to_user_name: field(fields, "ToUserName"),
        from_user_name: field(fields, "FromUserName"),
        create_time: parse_num(fields, "CreateTime").unwrap_or_default(),
        msg_id: parse_num(fields, "MsgId"),
    }
}

fn field(fields: &RawFields, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn opt_field(fields: &RawFields, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn parse_num<T: std::str::FromStr>(fields: &RawFields, name: &str) -> Option<T> {
    fields.get(name).and_then(|v| v.trim().parse().ok())
}

/// Flatten the children of the root element into a field map.
///
/// On error, returns the fields read so far together with the error.
pub fn parse_fields(xml: &str) -> std::result::Result<RawFields, (RawFields, anyhow::Error)> {
    let mut fields = RawFields::new();
    match read_fields(xml, &mut fields) {
        Ok(()) => Ok(fields),
        Err(e) => Err((fields, e)),
    }
}

fn read_fields(xml: &str, fields: &mut RawFields) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Element names from the root down; the root itself is not part of the key
    let mut path: Vec<String> = Vec::new();
    let mut seen_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if path.is_empty() {
                    if seen_root {
                        return Err(anyhow!("Multiple root elements"));
                    }
                    seen_root = true;
                }
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Event::Empty(e) => {
                if path.is_empty() {
                    seen_root = true;
                    continue;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                fields.entry(field_key(&path, &name)).or_default();
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(e) => {
                if path.len() > 1 {
                    let text = e.unescape()?;
                    append_text(fields, &path, &text);
                }
            }
            Event::CData(e) => {
                if path.len() > 1 {
                    let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                    append_text(fields, &path, &text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !path.is_empty() {
        return Err(anyhow!("Unclosed element <{}>", path.join("><")));
    }
    if !seen_root {
        return Err(anyhow!("Empty document"));
    }

    Ok(())
}

fn field_key(path: &[String], leaf: &str) -> String {
    let mut parts: Vec<&str> = path.iter().skip(1).map(String::as_str).collect();
    parts.push(leaf);
    parts.join(".")
}

fn append_text(fields: &mut RawFields, path: &[String], text: &str) {
    let key = path[1..].join(".");
    fields.entry(key).or_default().push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_parsing() {
        let xml = r#"<xml>
            <ToUserName><![CDATA[gh_abc]]></ToUserName>
            <FromUserName><![CDATA[user123]]></FromUserName>
            <CreateTime>1348831860</CreateTime>
            <MsgType><![CDATA[text]]></MsgType>
            <Content><![CDATA[hello]]></Content>
            <MsgId>1234567890123456</MsgId>
        </xml>"#;

        let msg = RequestMessage::parse(xml);
        assert_eq!(msg.header.to_user_name, "gh_abc");
        assert_eq!(msg.header.from_user_name, "user123");
        assert_eq!(msg.header.create_time, 1348831860);
        assert_eq!(msg.header.msg_id, Some(1234567890123456));
        assert_eq!(
            msg.payload,
            RequestPayload::Text {
                content: "hello".to_string()
            }
        );
        assert_eq!(msg.msg_type(), "text");
    }

    #[test]
    fn test_escaped_text_content() {
        let xml = "<xml><MsgType>text</MsgType><Content>a &amp; b &lt;c&gt;</Content></xml>";
        let msg = RequestMessage::parse(xml);
        assert_eq!(
            msg.payload,
            RequestPayload::Text {
                content: "a & b <c>".to_string()
            }
        );
    }

    #[test]
    fn test_voice_with_recognition() {
        let xml = r#"<xml>
            <FromUserName><![CDATA[u]]></FromUserName>
            <MsgType><![CDATA[voice]]></MsgType>
            <MediaId><![CDATA[media_1]]></MediaId>
            <Format><![CDATA[amr]]></Format>
            <Recognition><![CDATA[腾讯微信团队]]></Recognition>
        </xml>"#;

        match RequestMessage::parse(xml).payload {
            RequestPayload::Voice {
                media_id,
                format,
                recognition,
            } => {
                assert_eq!(media_id, "media_1");
                assert_eq!(format, "amr");
                assert_eq!(recognition.as_deref(), Some("腾讯微信团队"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_shortvideo_and_location() {
        let video = RequestMessage::parse(
            "<xml><MsgType>shortvideo</MsgType><MediaId>m</MediaId>\
             <ThumbMediaId>t</ThumbMediaId></xml>",
        );
        assert_eq!(video.msg_type(), "shortvideo");

        let location = RequestMessage::parse(
            r#"<xml><MsgType><![CDATA[location]]></MsgType>
            <Location_X>23.134521</Location_X><Location_Y>113.358803</Location_Y>
            <Scale>20</Scale><Label><![CDATA[位置信息]]></Label></xml>"#,
        );
        match location.payload {
            RequestPayload::Location {
                latitude,
                longitude,
                scale,
                label,
            } => {
                assert!((latitude - 23.134521).abs() < f64::EPSILON);
                assert!((longitude - 113.358803).abs() < f64::EPSILON);
                assert_eq!(scale, 20);
                assert_eq!(label, "位置信息");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_event_parsing() {
        let xml = r#"<xml>
            <ToUserName><![CDATA[gh_abc]]></ToUserName>
            <FromUserName><![CDATA[user123]]></FromUserName>
            <CreateTime>123456789</CreateTime>
            <MsgType><![CDATA[event]]></MsgType>
            <Event><![CDATA[CLICK]]></Event>
            <EventKey><![CDATA[MENU_HELP]]></EventKey>
        </xml>"#;

        let msg = RequestMessage::parse(xml);
        assert_eq!(msg.header.msg_id, None);
        match msg.payload {
            RequestPayload::Event {
                event, event_key, ..
            } => {
                assert_eq!(event, "CLICK");
                assert_eq!(event_key.as_deref(), Some("MENU_HELP"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_keeps_raw_fields() {
        let xml = r#"<xml>
            <FromUserName><![CDATA[user123]]></FromUserName>
            <MsgType><![CDATA[miniprogrampage]]></MsgType>
            <AppId><![CDATA[wxapp]]></AppId>
        </xml>"#;

        let msg = RequestMessage::parse(xml);
        assert_eq!(msg.header.from_user_name, "user123");
        match msg.payload {
            RequestPayload::Unknown { raw_type, fields } => {
                assert_eq!(raw_type, "miniprogrampage");
                assert_eq!(fields.get("AppId").map(String::as_str), Some("wxapp"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_xml_degrades_to_unknown() {
        let msg = RequestMessage::parse(
            "<xml><FromUserName>user123</FromUserName><MsgType>text</MsgType><Content>oops",
        );
        assert_eq!(msg.header.from_user_name, "user123");
        assert!(matches!(msg.payload, RequestPayload::Unknown { .. }));

        let empty = RequestMessage::parse("");
        assert!(matches!(empty.payload, RequestPayload::Unknown { .. }));
    }

    #[test]
    fn test_nested_fields_are_flattened() {
        let xml = r#"<xml>
            <MsgType>event</MsgType><Event>scancode_push</Event>
            <ScanCodeInfo><ScanType>qrcode</ScanType><ScanResult>1</ScanResult></ScanCodeInfo>
        </xml>"#;
        let fields = parse_fields(xml).map_err(|(_, e)| e).unwrap();
        assert_eq!(
            fields.get("ScanCodeInfo.ScanType").map(String::as_str),
            Some("qrcode")
        );
    }

    #[test]
    fn test_request_serializes_with_type_tag() {
        let msg = RequestMessage::parse(
            "<xml><FromUserName>u</FromUserName><MsgType>text</MsgType><Content>hi</Content></xml>",
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["msgType"], "text");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["fromUserName"], "u");
    }
}
