//! Process-global contact index: phone (E.164, no leading `+`) ↔ LID.
//!
//! Entries are populated lazily on first lookup from the WCL store; a hit
//! writes both directions so the reverse lookup never costs a second
//! round trip.

use quepasa_core::jid;
use quepasa_core::wcl::WhatsappClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
struct Maps {
    phone_to_lid: HashMap<String, String>,
    lid_to_phone: HashMap<String, String>,
}

#[derive(Default)]
pub struct LidIndex {
    maps: Mutex<Maps>,
}

impl LidIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a known pair, both directions.
    pub fn insert(&self, phone: &str, lid: &str) {
        let phone = phone.trim_start_matches('+').to_string();
        let mut maps = self.maps.lock().expect("lid lock");
        maps.phone_to_lid.insert(phone.clone(), lid.to_string());
        maps.lid_to_phone.insert(lid.to_string(), phone);
    }

    /// LID for a phone; falls through to the WCL store on a cache miss.
    pub async fn lid_for_phone(
        &self,
        client: &Arc<dyn WhatsappClient>,
        phone: &str,
    ) -> Option<String> {
        let phone = phone.trim_start_matches('+');
        if let Some(lid) = self
            .maps
            .lock()
            .expect("lid lock")
            .phone_to_lid
            .get(phone)
            .cloned()
        {
            return Some(lid);
        }

        match client.lid_for_phone(phone).await {
            Ok(Some(lid)) => {
                self.insert(phone, &lid);
                Some(lid)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("lid lookup failed for {phone}: {e}");
                None
            }
        }
    }

    /// Phone for a LID; falls through to the WCL store on a cache miss.
    pub async fn phone_for_lid(
        &self,
        client: &Arc<dyn WhatsappClient>,
        lid: &str,
    ) -> Option<String> {
        if let Some(phone) = self
            .maps
            .lock()
            .expect("lid lock")
            .lid_to_phone
            .get(lid)
            .cloned()
        {
            return Some(phone);
        }

        match client.phone_for_lid(lid).await {
            Ok(Some(phone)) => {
                self.insert(&phone, lid);
                Some(phone)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("phone lookup failed for {lid}: {e}");
                None
            }
        }
    }

    /// Rewrite an outbound chat id per the LID routing rule.
    ///
    /// `@lid` chats are resolved to the phone JID when a mapping exists
    /// (falling back to the LID itself); phone JIDs with a known LID
    /// mapping take the LID→phone round trip anyway, which forces the WCL
    /// to migrate the Signal session to the right address.
    pub async fn route_chat(&self, client: &Arc<dyn WhatsappClient>, chat_id: &str) -> String {
        if jid::is_lid(chat_id) {
            let lid_user = jid::user_part(chat_id);
            let lid = format!("{lid_user}{}", jid::SUFFIX_LID);
            if let Some(phone) = self.phone_for_lid(client, &lid).await {
                return jid::phone_to_jid(&phone);
            }
            return chat_id.to_string();
        }

        if let Some(phone) = jid::phone_from_jid(chat_id) {
            if let Some(lid) = self.lid_for_phone(client, &phone).await {
                if let Some(phone) = self.phone_for_lid(client, &lid).await {
                    return jid::phone_to_jid(&phone);
                }
            }
        }

        chat_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_bidirectional() {
        let index = LidIndex::new();
        index.insert("+5511999887766", "98765@lid");
        let maps = index.maps.lock().unwrap();
        assert_eq!(
            maps.phone_to_lid.get("5511999887766").map(String::as_str),
            Some("98765@lid")
        );
        assert_eq!(
            maps.lid_to_phone.get("98765@lid").map(String::as_str),
            Some("5511999887766")
        );
    }
}
