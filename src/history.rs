//! History-sync download support.
//!
//! A history-sync notification is cached as an `unhandled` message whose
//! debug info keeps the raw download fields. This module rebuilds a
//! downloadable envelope from that snapshot, names the resulting file,
//! and fingerprints the bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use quepasa_core::error::QpError;
use quepasa_core::wcl::{EventMessage, MediaKind, MediaRef};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Extension → mime, for filenames recovered from the direct path.
const EXT_MIME: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("mp4", "video/mp4"),
    ("3gp", "video/3gpp"),
    ("ogg", "audio/ogg"),
    ("opus", "audio/ogg; codecs=opus"),
    ("mp3", "audio/mpeg"),
    ("aac", "audio/aac"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("zip", "application/zip"),
    ("txt", "text/plain"),
    ("vcf", "text/x-vcard"),
];

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.to_ascii_lowercase();
    EXT_MIME
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Cheap magic-byte sniff for when the path gives no extension.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'%', b'P', b'D', b'F', ..] => Some("application/pdf"),
        [b'O', b'g', b'g', b'S', ..] => Some("audio/ogg"),
        [b'I', b'D', b'3', ..] => Some("audio/mpeg"),
        [b'P', b'K', 0x03, 0x04, ..] => Some("application/zip"),
        _ => None,
    }
}

fn path_extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let name = name.split('?').next()?;
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => Some(ext),
        _ => None,
    }
}

fn b64_field(info: &Value, field: &str) -> Result<Vec<u8>, QpError> {
    let raw = info
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| QpError::Input(format!("history info missing {field}")))?;
    BASE64
        .decode(raw)
        .map_err(|e| QpError::Input(format!("history info field {field} is not base64: {e}")))
}

/// Rebuild a downloadable envelope from the cached notification snapshot.
/// Image when the path suffix says so; document otherwise.
pub fn envelope_from_info(info: &Value) -> Result<MediaRef, QpError> {
    let direct_path = info
        .get("direct_path")
        .and_then(Value::as_str)
        .ok_or_else(|| QpError::Input("history info missing direct_path".to_string()))?
        .to_string();

    let ext = path_extension(&direct_path);
    let kind = match ext {
        Some("jpg") | Some("jpeg") | Some("png") | Some("webp") => MediaKind::Image,
        _ => MediaKind::Document,
    };
    let mime = info
        .get("mime")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ext.and_then(mime_for_extension).map(str::to_string))
        .unwrap_or_default();

    Ok(MediaRef {
        kind,
        direct_path,
        media_key: b64_field(info, "media_key")?,
        file_sha256: b64_field(info, "file_sha256")?,
        file_enc_sha256: b64_field(info, "file_enc_sha256")?,
        file_length: info.get("file_length").and_then(Value::as_u64).unwrap_or(0),
        mime,
    })
}

/// Mime and filename for freshly downloaded history bytes: extension
/// table, then content sniff, then octet-stream.
pub fn name_downloaded(media: &MediaRef, bytes: &[u8]) -> (String, String) {
    let ext = path_extension(&media.direct_path);
    let mime = if !media.mime.is_empty() {
        media.mime.clone()
    } else if let Some(mime) = ext.and_then(mime_for_extension) {
        mime.to_string()
    } else if let Some(mime) = sniff_mime(bytes) {
        mime.to_string()
    } else {
        "application/octet-stream".to_string()
    };

    let file_name = match ext {
        Some(ext) => format!("history.{ext}"),
        None => "history.bin".to_string(),
    };
    (mime, file_name)
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether a history-sync message passes the `HISTORYSYNCDAYS` filter:
/// `None` drops everything, `Some(0)` keeps everything, `Some(n)` keeps
/// messages newer than now − n days.
pub fn within_sync_window(event: &EventMessage, history_sync_days: Option<u32>) -> bool {
    match history_sync_days {
        None => false,
        Some(0) => true,
        Some(days) => event.timestamp > Utc::now() - Duration::days(days as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(path: &str) -> Value {
        json!({
            "direct_path": path,
            "media_key": BASE64.encode(b"key"),
            "file_sha256": BASE64.encode(b"plain"),
            "file_enc_sha256": BASE64.encode(b"enc"),
            "file_length": 42,
        })
    }

    #[test]
    fn image_suffixes_build_image_envelopes() {
        for path in ["/v/t62/x.jpg", "/v/t62/x.jpeg", "/v/x.png?tok=1", "/v/x.webp"] {
            let media = envelope_from_info(&info(path)).unwrap();
            assert_eq!(media.kind, MediaKind::Image, "{path}");
        }
        let media = envelope_from_info(&info("/v/t62/report.pdf")).unwrap();
        assert_eq!(media.kind, MediaKind::Document);
        assert_eq!(media.media_key, b"key");
        assert_eq!(media.file_length, 42);
    }

    #[test]
    fn missing_fields_are_input_errors() {
        assert!(envelope_from_info(&json!({})).is_err());
        assert!(envelope_from_info(&json!({
            "direct_path": "/x.jpg",
            "media_key": "not base64!!!",
            "file_sha256": "", "file_enc_sha256": ""
        }))
        .is_err());
    }

    #[test]
    fn naming_falls_back_extension_then_sniff_then_octet() {
        let media = envelope_from_info(&info("/v/x.png")).unwrap();
        let (mime, name) = name_downloaded(&media, &[]);
        assert_eq!(mime, "image/png");
        assert_eq!(name, "history.png");

        let media = envelope_from_info(&info("/v/noext")).unwrap();
        let (mime, _) = name_downloaded(&media, &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(mime, "image/jpeg");

        let (mime, name) = name_downloaded(&media, &[0x00, 0x01]);
        assert_eq!(mime, "application/octet-stream");
        assert_eq!(name, "history.bin");
    }

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sync_window_filter() {
        let mut event = EventMessage {
            id: "H1".into(),
            timestamp: Utc::now() - Duration::days(3),
            chat_jid: "1@s.whatsapp.net".into(),
            sender_jid: "1@s.whatsapp.net".into(),
            from_me: false,
            push_name: None,
            content: quepasa_core::wcl::MessageContent::Text("old".into()),
            quoted_id: None,
        };
        assert!(!within_sync_window(&event, None));
        assert!(within_sync_window(&event, Some(0)));
        assert!(within_sync_window(&event, Some(7)));
        assert!(!within_sync_window(&event, Some(1)));

        event.timestamp = Utc::now();
        assert!(within_sync_window(&event, Some(1)));
    }
}
