//! Inbound event → cached [`Message`] translation.
//!
//! A tagged dispatch over the known WCL content variants. Unknown
//! variants become `unhandled` records with a debug envelope; Signal
//! plumbing becomes `discard` and never reaches subscribers.

use crate::cache::MessageCache;
use crate::lid::LidIndex;
use quepasa_core::jid;
use quepasa_core::message::{
    Attachment, Chat, InReply, Message, MessageDebug, MessageStatus, MessageType, Poll,
};
use quepasa_core::wcl::{EventMessage, MediaKind, MediaPayload, MessageContent, WhatsappClient};
use serde_json::json;
use std::sync::Arc;

/// Content-level translation result, before chat/contact enrichment.
#[derive(Default)]
struct ContentParts {
    kind: MessageType,
    text: String,
    attachment: Option<Attachment>,
    poll: Option<Poll>,
    url: Option<String>,
    ads: Option<serde_json::Value>,
    forwarding_score: u32,
    debug: Option<MessageDebug>,
    /// Stanza id this content targets (reactions, poll updates, revokes).
    target_id: Option<String>,
    info_for_history: Option<serde_json::Value>,
}

fn attachment_from(payload: &MediaPayload) -> Attachment {
    Attachment {
        mime: payload.media.mime.clone(),
        file_length: payload.media.file_length,
        file_name: payload.file_name.clone(),
        seconds: payload.seconds,
        waveform: payload.waveform.clone(),
        thumbnail: payload.thumbnail.clone(),
        ptt: payload.ptt,
        media: Some(payload.media.clone()),
        ..Default::default()
    }
}

fn media_kind_type(kind: MediaKind) -> MessageType {
    match kind {
        MediaKind::Image | MediaKind::Sticker => MessageType::Image,
        MediaKind::Document => MessageType::Document,
        MediaKind::Audio => MessageType::Audio,
        MediaKind::Video => MessageType::Video,
    }
}

fn translate_content(content: &MessageContent) -> ContentParts {
    match content {
        MessageContent::Text(text) => ContentParts {
            kind: MessageType::Text,
            text: text.clone(),
            ..Default::default()
        },
        MessageContent::ExtendedText {
            text,
            url,
            ads,
            forwarding_score,
        } => ContentParts {
            kind: MessageType::Text,
            text: text.clone(),
            url: url.clone(),
            ads: ads.clone(),
            forwarding_score: *forwarding_score,
            ..Default::default()
        },
        MessageContent::Image(payload)
        | MessageContent::Sticker(payload)
        | MessageContent::Document(payload)
        | MessageContent::Audio(payload)
        | MessageContent::Video(payload) => ContentParts {
            kind: media_kind_type(payload.media.kind),
            text: payload.caption.clone().unwrap_or_default(),
            attachment: Some(attachment_from(payload)),
            ..Default::default()
        },
        MessageContent::Ephemeral(inner) => translate_content(inner),
        MessageContent::ButtonsResponse(text)
        | MessageContent::Template(text)
        | MessageContent::TemplateButtonReply(text)
        | MessageContent::List(text) => ContentParts {
            kind: MessageType::Text,
            text: text.clone(),
            ..Default::default()
        },
        MessageContent::Location {
            latitude,
            longitude,
            name,
        } => ContentParts {
            kind: MessageType::Location,
            text: name.clone().unwrap_or_default(),
            url: Some(format!("https://maps.google.com/?q={latitude},{longitude}")),
            ..Default::default()
        },
        MessageContent::LiveLocation {
            latitude,
            longitude,
        } => ContentParts {
            kind: MessageType::Location,
            url: Some(format!("https://maps.google.com/?q={latitude},{longitude}")),
            ..Default::default()
        },
        MessageContent::Contact {
            display_name,
            vcard,
        } => ContentParts {
            kind: MessageType::Contact,
            text: display_name.clone(),
            attachment: Some(Attachment {
                mime: "text/x-vcard".to_string(),
                file_length: vcard.len() as u64,
                file_name: Some(format!("{display_name}.vcf")),
                content: Some(vcard.clone().into_bytes()),
                ..Default::default()
            }),
            ..Default::default()
        },
        MessageContent::ContactsArray(contacts) => ContentParts {
            kind: MessageType::Contact,
            text: contacts
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            ..Default::default()
        },
        MessageContent::Reaction { target_id, emoji } => ContentParts {
            kind: MessageType::Text,
            text: emoji.clone(),
            target_id: Some(target_id.clone()),
            ..Default::default()
        },
        MessageContent::Edit { target_id, text } => ContentParts {
            kind: MessageType::Text,
            text: text.clone(),
            target_id: Some(target_id.clone()),
            ..Default::default()
        },
        MessageContent::PollCreation { question, options } => ContentParts {
            kind: MessageType::Poll,
            text: question.clone(),
            poll: Some(Poll {
                question: question.clone(),
                options: options.clone(),
                selections: Vec::new(),
            }),
            ..Default::default()
        },
        MessageContent::PollUpdate {
            target_id,
            selections,
        } => ContentParts {
            kind: MessageType::Poll,
            poll: Some(Poll {
                selections: selections.clone(),
                ..Default::default()
            }),
            target_id: Some(target_id.clone()),
            ..Default::default()
        },
        MessageContent::Protocol {
            kind,
            target_id,
            info,
        } => {
            if kind == "revoke" {
                ContentParts {
                    kind: MessageType::Revoke,
                    target_id: target_id.clone(),
                    ..Default::default()
                }
            } else {
                // History-sync notifications keep their download fields in
                // the debug envelope; /history/download rebuilds from it.
                let is_history = kind == "history_sync_notification";
                ContentParts {
                    kind: MessageType::Unhandled,
                    debug: Some(MessageDebug {
                        event: format!("protocol:{kind}"),
                        info: info.clone(),
                        reason: None,
                    }),
                    info_for_history: is_history.then(|| info.clone()),
                    ..Default::default()
                }
            }
        }
        MessageContent::SenderKeyDistribution | MessageContent::StickerSync => ContentParts {
            kind: MessageType::Discard,
            ..Default::default()
        },
        MessageContent::Unknown { tag, payload } => ContentParts {
            kind: MessageType::Unhandled,
            debug: Some(MessageDebug {
                event: tag.clone(),
                info: payload.clone(),
                reason: Some("unknown content variant".to_string()),
            }),
            ..Default::default()
        },
    }
}

/// Trim and collapse internal whitespace.
fn normalize_title(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Direct-chat title priority: business > full > push > first name.
async fn resolve_direct_title(client: &Arc<dyn WhatsappClient>, jid: &str) -> Option<String> {
    let info = client.contact_info(jid).await.ok().flatten()?;
    [
        info.business_name,
        info.full_name,
        info.push_name,
        info.first_name,
    ]
    .into_iter()
    .flatten()
    .map(|name| normalize_title(&name))
    .find(|name| !name.is_empty())
}

async fn resolve_group_title(client: &Arc<dyn WhatsappClient>, jid: &str) -> Option<String> {
    if let Ok(Some(name)) = client.group_name(jid).await {
        let name = normalize_title(&name);
        if !name.is_empty() {
            return Some(name);
        }
    }
    // Slow path: group-info lookup; the WCL memoises it.
    client
        .group_info(jid)
        .await
        .ok()
        .map(|info| normalize_title(&info.name))
        .filter(|name| !name.is_empty())
}

/// Build the chat identity for a jid: title, phone and lid enrichment.
pub async fn resolve_chat(
    client: &Arc<dyn WhatsappClient>,
    lids: &LidIndex,
    chat_jid: &str,
) -> Chat {
    let mut chat = Chat::new(chat_jid);

    if jid::is_group(chat_jid) {
        chat.title = resolve_group_title(client, chat_jid).await;
        return chat;
    }

    if jid::is_lid(chat_jid) {
        chat.lid = Some(chat_jid.to_string());
        if let Some(phone) = lids.phone_for_lid(client, chat_jid).await {
            chat.phone = Some(phone);
        }
    } else if let Some(phone) = jid::phone_from_jid(chat_jid) {
        chat.phone = Some(phone.clone());
        chat.lid = lids.lid_for_phone(client, &phone).await;
    }

    chat.title = resolve_direct_title(client, chat_jid).await;
    if chat.title.is_none() {
        chat.title = chat.phone.clone();
    }
    chat
}

/// Full translation pipeline for one inbound message event.
pub async fn translate(
    event: &EventMessage,
    client: &Arc<dyn WhatsappClient>,
    lids: &LidIndex,
    cache: &MessageCache,
    from_history: bool,
) -> Message {
    let parts = translate_content(&event.content);

    let chat = resolve_chat(client, lids, &event.chat_jid).await;

    let participant = if jid::is_group(&event.chat_jid) {
        Some(resolve_chat(client, lids, &event.sender_jid).await)
    } else {
        None
    };

    // Reply context: quoted stanza, or the target of a reaction/update.
    let quoted = event
        .quoted_id
        .as_deref()
        .or(parts.target_id.as_deref())
        .map(|id| match cache.get(id) {
            Some(original) => InReply {
                id: id.to_string(),
                text: original.text,
                chat_id: Some(original.chat.id),
            },
            None => {
                tracing::debug!("quoted message {id} not cached");
                InReply {
                    id: id.to_string(),
                    ..Default::default()
                }
            }
        });

    Message {
        id: event.id.clone(),
        timestamp: event.timestamp,
        kind: parts.kind,
        chat,
        participant,
        text: parts.text,
        attachment: parts.attachment,
        poll: parts.poll,
        url: parts.url,
        ads: parts.ads,
        in_reply: quoted,
        forwarding_score: parts.forwarding_score,
        from_me: event.from_me,
        from_history,
        status: MessageStatus::Imported,
        debug: parts.debug,
        info_for_history: parts.info_for_history,
        ..Default::default()
    }
}

/// Synthetic `system` record used for lifecycle notices (logout, etc.).
/// Not flagged internal: subscribers must observe these.
pub fn system_message(id: &str, wid: &str, text: &str) -> Message {
    Message {
        id: id.to_string(),
        timestamp: chrono::Utc::now(),
        kind: MessageType::System,
        chat: Chat::new(wid),
        text: text.to_string(),
        debug: Some(MessageDebug {
            event: "system".to_string(),
            info: json!({ "wid": wid }),
            reason: None,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quepasa_core::wcl::MediaRef;

    #[test]
    fn text_variants_map_to_text() {
        let parts = translate_content(&MessageContent::Text("oi".into()));
        assert_eq!(parts.kind, MessageType::Text);
        assert_eq!(parts.text, "oi");

        let parts = translate_content(&MessageContent::ExtendedText {
            text: "look".into(),
            url: Some("https://x".into()),
            ads: None,
            forwarding_score: 3,
        });
        assert_eq!(parts.kind, MessageType::Text);
        assert_eq!(parts.forwarding_score, 3);
        assert_eq!(parts.url.as_deref(), Some("https://x"));
    }

    #[test]
    fn media_carries_download_handle() {
        let parts = translate_content(&MessageContent::Audio(MediaPayload {
            media: MediaRef {
                kind: MediaKind::Audio,
                mime: "audio/ogg; codecs=opus".into(),
                file_length: 777,
                ..Default::default()
            },
            seconds: Some(12),
            ptt: true,
            ..Default::default()
        }));
        assert_eq!(parts.kind, MessageType::Audio);
        let a = parts.attachment.unwrap();
        assert!(a.ptt);
        assert_eq!(a.seconds, Some(12));
        assert_eq!(a.file_length, 777);
        assert!(a.media.is_some());
    }

    #[test]
    fn ephemeral_unwraps_to_inner() {
        let parts = translate_content(&MessageContent::Ephemeral(Box::new(
            MessageContent::Text("vanishing".into()),
        )));
        assert_eq!(parts.kind, MessageType::Text);
        assert_eq!(parts.text, "vanishing");
    }

    #[test]
    fn signal_plumbing_is_discarded() {
        assert_eq!(
            translate_content(&MessageContent::SenderKeyDistribution).kind,
            MessageType::Discard
        );
        assert_eq!(
            translate_content(&MessageContent::StickerSync).kind,
            MessageType::Discard
        );
    }

    #[test]
    fn unknown_becomes_unhandled_with_debug() {
        let parts = translate_content(&MessageContent::Unknown {
            tag: "futureMessage".into(),
            payload: json!({"a": 1}),
        });
        assert_eq!(parts.kind, MessageType::Unhandled);
        let debug = parts.debug.unwrap();
        assert_eq!(debug.event, "futureMessage");
        assert_eq!(debug.info["a"], 1);
    }

    #[test]
    fn history_notification_keeps_anchor_info() {
        let info = json!({"direct_path": "/v/t62.7118", "file_sha256": "qqqq"});
        let parts = translate_content(&MessageContent::Protocol {
            kind: "history_sync_notification".into(),
            target_id: None,
            info: info.clone(),
        });
        assert_eq!(parts.kind, MessageType::Unhandled);
        assert_eq!(parts.info_for_history, Some(info));

        let other = translate_content(&MessageContent::Protocol {
            kind: "app_state_sync_key_share".into(),
            target_id: None,
            info: json!({}),
        });
        assert!(other.info_for_history.is_none());
    }

    #[test]
    fn revoke_targets_the_original() {
        let parts = translate_content(&MessageContent::Protocol {
            kind: "revoke".into(),
            target_id: Some("3EB0".into()),
            info: json!({}),
        });
        assert_eq!(parts.kind, MessageType::Revoke);
        assert_eq!(parts.target_id.as_deref(), Some("3EB0"));
    }

    #[test]
    fn titles_are_normalized() {
        assert_eq!(normalize_title("  Ada   Lovelace \n"), "Ada Lovelace");
        assert_eq!(normalize_title(""), "");
    }
}
