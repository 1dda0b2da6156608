//! The cached message model and its satellite types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content class of a cached message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Location,
    Contact,
    Call,
    System,
    Group,
    Revoke,
    Poll,
    /// Internal protocol noise (sender-key distribution, sticker sync);
    /// dropped before dispatch.
    Discard,
    /// Known event shape, unknown content variant; carries a debug envelope.
    Unhandled,
    #[default]
    Unknown,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// Delivery status, monotonically increasing by numeric rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Unknown,
    Error,
    Imported,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Unknown => 0,
            MessageStatus::Error => 1,
            MessageStatus::Imported => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
        }
    }
}

/// Chat (conversation) identity attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Chat {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// A media attachment. Raw bytes are never serialized to subscribers and
/// may be absent until the first download.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    #[serde(rename = "filelength")]
    pub file_length: u64,
    #[serde(rename = "filename", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<u8>>,
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
    /// Public gateway URL for the download endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base-64 thumbnail, serialized with a `data:<mime>;base64,` prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// SHA-256 hex of the content, set after a history download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Render as a voice note even if the mime is not ogg/opus.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ptt: bool,
    /// WCL download handle, kept so `/download` can fetch bytes lazily.
    #[serde(skip)]
    pub media: Option<crate::wcl::MediaRef>,
}

impl Attachment {
    /// Data-URI form of the thumbnail for SPA consumption.
    pub fn thumbnail_data_uri(&self) -> Option<String> {
        self.thumbnail
            .as_ref()
            .map(|b64| format!("data:{};base64,{b64}", self.mime))
    }
}

/// Poll payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<String>,
}

/// Quoted-message context carried for replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InReply {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

/// Debug envelope for unhandled/protocol events: raw event tag + payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDebug {
    pub event: String,
    #[serde(default)]
    pub info: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One cached message. The id is unique within a tenant (case-insensitive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Caller-supplied correlation id; non-empty values are suppressed for
    /// subscribers without `forward_internal` to break dispatch loops.
    #[serde(rename = "trackid", default, skip_serializing_if = "String::is_empty")]
    pub track_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub chat: Chat,
    /// Present iff the chat is a group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<Chat>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<Poll>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Opaque advertising metadata, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ads: Option<Value>,
    #[serde(rename = "inreply", skip_serializing_if = "Option::is_none")]
    pub in_reply: Option<InReply>,
    #[serde(
        rename = "forwardingscore",
        default,
        skip_serializing_if = "is_zero_u32"
    )]
    pub forwarding_score: u32,
    #[serde(rename = "fromme", default)]
    pub from_me: bool,
    /// Originated by this gateway (API send).
    #[serde(rename = "frominternal", default)]
    pub from_internal: bool,
    /// Delivered by history sync rather than live.
    #[serde(rename = "fromhistory", default, skip_serializing_if = "is_false")]
    pub from_history: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub edited: bool,
    #[serde(default)]
    pub status: MessageStatus,
    /// Free-form dispatch-error strings appended by the dispatcher.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<MessageDebug>,
    /// History-sync anchor snapshot. Never serialized to subscribers.
    #[serde(skip)]
    pub info_for_history: Option<Value>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Message {
    /// Whether the dispatcher marked at least one delivery error.
    pub fn has_dispatch_error(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// Apply a status update, honoring the monotonic rank ordering.
    /// Returns true when the status actually advanced.
    pub fn advance_status(&mut self, status: MessageStatus) -> bool {
        if status.rank() > self.status.rank() {
            self.status = status;
            return true;
        }
        false
    }

    /// Truncated text for log lines and list views.
    pub fn synopsis(&self, max: usize) -> String {
        let mut out: String = self.text.chars().take(max).collect();
        if self.text.chars().count() > max {
            out.push('…');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_monotonic() {
        let mut m = Message::default();
        assert!(m.advance_status(MessageStatus::Delivered));
        assert!(m.advance_status(MessageStatus::Read));
        // A later, lower-ranked receipt is ignored.
        assert!(!m.advance_status(MessageStatus::Delivered));
        assert_eq!(m.status, MessageStatus::Read);
    }

    #[test]
    fn history_info_never_serialized() {
        let m = Message {
            id: "A1".into(),
            info_for_history: Some(serde_json::json!({"direct_path": "/v/t62"})),
            ..Default::default()
        };
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("info_for_history").is_none());
        assert!(json.get("infoforhistory").is_none());
    }

    #[test]
    fn attachment_content_never_serialized() {
        let a = Attachment {
            mime: "image/jpeg".into(),
            content: Some(vec![1, 2, 3]),
            thumbnail: Some("aGk=".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&a).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(
            a.thumbnail_data_uri().as_deref(),
            Some("data:image/jpeg;base64,aGk=")
        );
    }

    #[test]
    fn synopsis_truncates() {
        let m = Message {
            text: "abcdefghij".into(),
            ..Default::default()
        };
        assert_eq!(m.synopsis(4), "abcd…");
        assert_eq!(m.synopsis(20), "abcdefghij");
    }

    #[test]
    fn type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageType::Unhandled).unwrap(),
            "\"unhandled\""
        );
        assert_eq!(MessageType::Revoke.to_string(), "revoke");
    }
}
