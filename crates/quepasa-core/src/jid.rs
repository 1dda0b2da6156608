//! JID (chat id) helpers.
//!
//! The suffix determines the namespace: `@s.whatsapp.net` for phone-based
//! users, `@g.us` for groups, `@lid` for business identifiers,
//! `@broadcast` and `@newsletter` for one-to-many channels.

pub const SUFFIX_USER: &str = "@s.whatsapp.net";
pub const SUFFIX_GROUP: &str = "@g.us";
pub const SUFFIX_LID: &str = "@lid";
pub const SUFFIX_BROADCAST: &str = "@broadcast";
pub const SUFFIX_NEWSLETTER: &str = "@newsletter";

pub fn is_group(jid: &str) -> bool {
    jid.ends_with(SUFFIX_GROUP)
}

pub fn is_lid(jid: &str) -> bool {
    jid.ends_with(SUFFIX_LID)
}

pub fn is_broadcast(jid: &str) -> bool {
    jid.ends_with(SUFFIX_BROADCAST) || jid.ends_with(SUFFIX_NEWSLETTER)
}

pub fn is_newsletter(jid: &str) -> bool {
    jid.ends_with(SUFFIX_NEWSLETTER)
}

pub fn is_user(jid: &str) -> bool {
    jid.ends_with(SUFFIX_USER)
}

/// The local part before `@`, stripped of any device/agent suffix
/// (`5511999887766.0:12@s.whatsapp.net` → `5511999887766`).
pub fn user_part(jid: &str) -> &str {
    let local = jid.split('@').next().unwrap_or(jid);
    let local = local.split(':').next().unwrap_or(local);
    local.split('.').next().unwrap_or(local)
}

/// Extract an E.164 phone (digits only, no leading `+`) from a phone JID.
/// Returns `None` for groups, LIDs and broadcast namespaces.
pub fn phone_from_jid(jid: &str) -> Option<String> {
    if !is_user(jid) {
        return None;
    }
    let user = user_part(jid);
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(user.to_string())
}

/// Build a phone JID from digits (leading `+` tolerated).
pub fn phone_to_jid(phone: &str) -> String {
    format!("{}{SUFFIX_USER}", phone.trim_start_matches('+'))
}

/// Normalize a caller-supplied chat id: trim whitespace and append the
/// user suffix when the input is a bare phone number.
pub fn normalize_chat_id(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty chat id".to_string());
    }
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }
    let digits = trimmed.trim_start_matches('+');
    if digits.chars().all(|c| c.is_ascii_digit()) && !digits.is_empty() {
        return Ok(phone_to_jid(digits));
    }
    Err(format!("invalid chat id: {trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces() {
        assert!(is_group("123-456@g.us"));
        assert!(is_lid("98765@lid"));
        assert!(is_broadcast("status@broadcast"));
        assert!(is_broadcast("123@newsletter"));
        assert!(is_user("5511999887766@s.whatsapp.net"));
    }

    #[test]
    fn phone_extraction() {
        assert_eq!(
            phone_from_jid("5511999887766@s.whatsapp.net").as_deref(),
            Some("5511999887766")
        );
        assert_eq!(
            phone_from_jid("5511999887766.0:12@s.whatsapp.net").as_deref(),
            Some("5511999887766")
        );
        assert_eq!(phone_from_jid("123-456@g.us"), None);
        assert_eq!(phone_from_jid("98765@lid"), None);
    }

    #[test]
    fn normalize() {
        assert_eq!(
            normalize_chat_id(" +5511999887766 ").unwrap(),
            "5511999887766@s.whatsapp.net"
        );
        assert_eq!(normalize_chat_id("abc@g.us").unwrap(), "abc@g.us");
        assert!(normalize_chat_id("not a phone").is_err());
        assert!(normalize_chat_id("").is_err());
    }
}
