//! WhatsApp client library (WCL) adapter contract.
//!
//! The wire protocol itself (pairing, Noise handshake, Signal sessions,
//! media crypto) lives behind this trait; the gateway owns one adapter
//! instance per tenant. The adapter MUST serialize event delivery per
//! tenant: no two event callbacks run concurrently for the same tenant,
//! so tenant handlers need no locks on tenant-local state.

use crate::error::QpError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Media class used for download envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Sticker,
    #[default]
    Document,
    Audio,
    Video,
}

/// Everything the WCL needs to fetch media bytes later.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
    pub mime: String,
}

/// Typed media payload attached to an inbound content variant.
#[derive(Debug, Clone, Default)]
pub struct MediaPayload {
    pub media: MediaRef,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    pub seconds: Option<u32>,
    pub waveform: Option<Vec<u8>>,
    /// Base-64 JPEG preview, when the event carried one.
    pub thumbnail: Option<String>,
    pub ptt: bool,
}

/// Tagged content variants the translator dispatches over (§ message
/// translation). Unknown variants become `unhandled` cached messages.
#[derive(Debug, Clone)]
pub enum MessageContent {
    Text(String),
    ExtendedText {
        text: String,
        url: Option<String>,
        ads: Option<Value>,
        forwarding_score: u32,
    },
    Image(MediaPayload),
    Sticker(MediaPayload),
    Document(MediaPayload),
    Audio(MediaPayload),
    Video(MediaPayload),
    /// Disappearing-message wrapper; translate the inner content.
    Ephemeral(Box<MessageContent>),
    ButtonsResponse(String),
    Template(String),
    TemplateButtonReply(String),
    List(String),
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    LiveLocation {
        latitude: f64,
        longitude: f64,
    },
    Contact {
        display_name: String,
        vcard: String,
    },
    ContactsArray(Vec<(String, String)>),
    Reaction {
        target_id: String,
        emoji: String,
    },
    Edit {
        target_id: String,
        text: String,
    },
    /// Protocol messages (revokes, history-sync notifications, app state).
    Protocol {
        kind: String,
        target_id: Option<String>,
        info: Value,
    },
    PollCreation {
        question: String,
        options: Vec<String>,
    },
    PollUpdate {
        target_id: String,
        selections: Vec<String>,
    },
    /// Signal plumbing; cached as `discard` and never dispatched.
    SenderKeyDistribution,
    StickerSync,
    Unknown {
        tag: String,
        payload: Value,
    },
}

/// One inbound message event, already decrypted by the WCL.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub chat_jid: String,
    pub sender_jid: String,
    pub from_me: bool,
    pub push_name: Option<String>,
    pub content: MessageContent,
    /// Stanza id of the quoted message, when replying.
    pub quoted_id: Option<String>,
}

/// Receipt classes the gateway cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    Delivered,
    Read,
    /// Read on another device of the same account.
    ReadSelf,
}

#[derive(Debug, Clone)]
pub struct EventReceipt {
    pub ids: Vec<String>,
    pub chat_jid: String,
    pub sender_jid: Option<String>,
    pub receipt: ReceiptType,
    pub timestamp: DateTime<Utc>,
}

/// Events the adapter delivers, serialized per tenant. Events the core
/// does not understand arrive as `Unknown` and MUST NOT abort the loop.
#[derive(Debug, Clone)]
pub enum WclEvent {
    Message(Box<EventMessage>),
    Receipt(EventReceipt),
    CallOffer {
        call_id: String,
        from_jid: String,
        timestamp: DateTime<Utc>,
    },
    CallNotice {
        call_id: String,
        payload: Value,
    },
    Connected {
        wid: String,
    },
    Disconnected {
        reason: String,
    },
    LoggedOut {
        reason: String,
    },
    HistorySync {
        messages: Vec<EventMessage>,
        progress: Option<u32>,
    },
    JoinedGroup {
        jid: String,
        subject: String,
    },
    Contact {
        jid: String,
        full_name: Option<String>,
        push_name: Option<String>,
    },
    PushNameSetting(String),
    AppStateSyncComplete,
    PairSuccess {
        wid: String,
    },
    Unknown {
        tag: String,
        payload: Value,
    },
}

/// QR pairing stream items.
#[derive(Debug, Clone)]
pub enum QrItem {
    Code(String),
    Timeout,
}

/// Outbound send payload handed to the WCL.
#[derive(Debug, Clone, Default)]
pub struct SendPayload {
    pub chat_jid: String,
    pub text: String,
    pub attachment: Option<SendAttachment>,
    pub poll: Option<crate::message::Poll>,
    /// Stanza id to quote.
    pub in_reply_id: Option<String>,
    /// Quoted content for reply context, when known from the cache.
    pub in_reply_text: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendAttachment {
    pub mime: String,
    pub file_name: Option<String>,
    pub content: Vec<u8>,
    pub ptt: bool,
    pub seconds: Option<u32>,
}

/// Result of a WCL send: the server-assigned id plus timestamp.
#[derive(Debug, Clone)]
pub struct SendResponse {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// Chat presence indicator classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPresence {
    Paused,
    Composing,
    Recording,
}

/// Global presence of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalPresence {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub jid: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupInfo {
    pub jid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantsAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// Contact naming data from the WCL store, used for title resolution.
#[derive(Debug, Clone, Default)]
pub struct ContactInfo {
    pub jid: String,
    pub business_name: Option<String>,
    pub full_name: Option<String>,
    pub push_name: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub jid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture_id: Option<String>,
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Mark-read receipt classes accepted by `mark_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadType {
    Read,
    Played,
}

/// Abstract interface to the WhatsApp client library. One instance per
/// tenant; all operations may suspend.
#[async_trait]
pub trait WhatsappClient: Send + Sync {
    /// Open the socket and begin login. MUST NOT block past the initial
    /// socket bring-up; login completion arrives as [`WclEvent::Connected`].
    async fn connect(&self) -> Result<(), QpError>;

    /// Close the socket, leaving device credentials intact.
    async fn disconnect(&self) -> Result<(), QpError>;

    /// Log out and erase device credentials.
    async fn logout(&self) -> Result<(), QpError>;

    fn set_auto_reconnect(&self, enabled: bool);

    fn is_connected(&self) -> bool;

    /// The paired device id, when known.
    fn wid(&self) -> Option<String>;

    /// Request a pairing code for the given phone.
    async fn pair_phone(&self, phone: &str) -> Result<String, QpError>;

    /// Stream of QR codes until scan or timeout.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrItem>, QpError>;

    async fn send(&self, payload: SendPayload) -> Result<SendResponse, QpError>;

    async fn edit(&self, chat_jid: &str, message_id: &str, text: &str) -> Result<(), QpError>;

    async fn revoke(
        &self,
        chat_jid: &str,
        message_id: &str,
        participant: Option<&str>,
    ) -> Result<(), QpError>;

    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, QpError>;

    async fn send_chat_presence(&self, chat_jid: &str, presence: ChatPresence)
        -> Result<(), QpError>;

    async fn send_global_presence(&self, presence: GlobalPresence) -> Result<(), QpError>;

    async fn mark_read(
        &self,
        ids: &[String],
        chat_jid: &str,
        sender_jid: Option<&str>,
        receipt: MarkReadType,
    ) -> Result<(), QpError>;

    async fn reject_call(&self, call_id: &str, from_jid: &str) -> Result<(), QpError>;

    /// Flag the whole chat as unread on the paired device.
    async fn mark_chat_unread(&self, chat_jid: &str) -> Result<(), QpError>;

    async fn archive_chat(&self, chat_jid: &str, archive: bool) -> Result<(), QpError>;

    // Group operations.
    async fn group_create(
        &self,
        name: &str,
        participants: &[String],
    ) -> Result<GroupInfo, QpError>;
    async fn group_info(&self, jid: &str) -> Result<GroupInfo, QpError>;
    async fn group_list(&self) -> Result<Vec<GroupInfo>, QpError>;
    async fn group_set_name(&self, jid: &str, name: &str) -> Result<(), QpError>;
    async fn group_set_topic(&self, jid: &str, topic: &str) -> Result<(), QpError>;
    async fn group_set_photo(&self, jid: &str, jpeg: &[u8]) -> Result<(), QpError>;
    async fn group_update_participants(
        &self,
        jid: &str,
        participants: &[String],
        action: ParticipantsAction,
    ) -> Result<Vec<GroupParticipant>, QpError>;
    async fn group_join_requests(&self, jid: &str) -> Result<Vec<String>, QpError>;
    async fn group_handle_requests(
        &self,
        jid: &str,
        users: &[String],
        approve: bool,
    ) -> Result<(), QpError>;
    async fn group_leave(&self, jid: &str) -> Result<(), QpError>;
    async fn group_invite_link(&self, jid: &str) -> Result<String, QpError>;

    async fn get_profile_picture(&self, jid: &str) -> Result<Option<String>, QpError>;

    /// Which of the given phones are registered; returns their JIDs.
    async fn is_on_whatsapp(&self, phones: &[String]) -> Result<Vec<String>, QpError>;

    async fn get_user_info(&self, jids: &[String]) -> Result<Vec<UserInfo>, QpError>;

    // Store lookups used by title resolution and the LID index.
    async fn contact_info(&self, jid: &str) -> Result<Option<ContactInfo>, QpError>;
    async fn all_contacts(&self) -> Result<Vec<ContactInfo>, QpError>;
    async fn lid_for_phone(&self, phone: &str) -> Result<Option<String>, QpError>;
    async fn phone_for_lid(&self, lid: &str) -> Result<Option<String>, QpError>;
    async fn group_name(&self, jid: &str) -> Result<Option<String>, QpError>;
}

/// Builds one adapter per tenant. Events go to `events`; the factory owns
/// transport/store wiring.
#[async_trait]
pub trait WclFactory: Send + Sync {
    async fn create(
        &self,
        token: &str,
        events: mpsc::Sender<WclEvent>,
    ) -> Result<std::sync::Arc<dyn WhatsappClient>, QpError>;
}
