//! Test doubles shared by the unit tests: a recording WCL adapter with
//! scriptable store lookups, and a factory that exposes the event sender
//! so tests can inject events.

use async_trait::async_trait;
use chrono::Utc;
use quepasa_core::error::QpError;
use quepasa_core::wcl::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MockWcl {
    pub connected: AtomicBool,
    pub auto_reconnect: AtomicBool,
    pub device_wid: Mutex<Option<String>>,
    pub sent: Mutex<Vec<SendPayload>>,
    pub edits: Mutex<Vec<(String, String, String)>>,
    pub revokes: Mutex<Vec<(String, String)>>,
    pub presences: Mutex<Vec<(String, ChatPresence)>>,
    pub global_presences: Mutex<Vec<GlobalPresence>>,
    pub rejected_calls: Mutex<Vec<String>>,
    pub marked_read: Mutex<Vec<(Vec<String>, String)>>,
    pub marked_unread: Mutex<Vec<String>>,
    pub archived: Mutex<Vec<(String, bool)>>,
    pub logged_out: AtomicBool,
    /// Scripted store state.
    pub contacts: Mutex<HashMap<String, ContactInfo>>,
    pub group_names: Mutex<HashMap<String, String>>,
    pub lid_by_phone: Mutex<HashMap<String, String>>,
    pub phone_by_lid: Mutex<HashMap<String, String>>,
    pub downloads: Mutex<HashMap<String, Vec<u8>>>,
    pub lookup_count: AtomicU32,
    next_send: AtomicU32,
}

impl MockWcl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn map_lid(&self, phone: &str, lid: &str) {
        self.lid_by_phone
            .lock()
            .unwrap()
            .insert(phone.to_string(), lid.to_string());
        self.phone_by_lid
            .lock()
            .unwrap()
            .insert(lid.to_string(), phone.to_string());
    }
}

#[async_trait]
impl WhatsappClient for MockWcl {
    async fn connect(&self) -> Result<(), QpError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), QpError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
    async fn logout(&self) -> Result<(), QpError> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn wid(&self) -> Option<String> {
        self.device_wid.lock().unwrap().clone()
    }
    async fn pair_phone(&self, _phone: &str) -> Result<String, QpError> {
        Ok("ABCD-1234".to_string())
    }
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrItem>, QpError> {
        let (tx, rx) = mpsc::channel(4);
        let _ = tx.send(QrItem::Code("qr-payload-1".to_string())).await;
        let _ = tx.send(QrItem::Timeout).await;
        Ok(rx)
    }
    async fn send(&self, payload: SendPayload) -> Result<SendResponse, QpError> {
        let n = self.next_send.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(payload);
        Ok(SendResponse {
            id: format!("SENT{n:04}"),
            timestamp: Utc::now(),
        })
    }
    async fn edit(&self, chat_jid: &str, message_id: &str, text: &str) -> Result<(), QpError> {
        self.edits.lock().unwrap().push((
            chat_jid.to_string(),
            message_id.to_string(),
            text.to_string(),
        ));
        Ok(())
    }
    async fn revoke(
        &self,
        chat_jid: &str,
        message_id: &str,
        _participant: Option<&str>,
    ) -> Result<(), QpError> {
        self.revokes
            .lock()
            .unwrap()
            .push((chat_jid.to_string(), message_id.to_string()));
        Ok(())
    }
    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, QpError> {
        self.downloads
            .lock()
            .unwrap()
            .get(&media.direct_path)
            .cloned()
            .ok_or_else(|| QpError::Upstream("media not available".to_string()))
    }
    async fn send_chat_presence(
        &self,
        chat_jid: &str,
        presence: ChatPresence,
    ) -> Result<(), QpError> {
        self.presences
            .lock()
            .unwrap()
            .push((chat_jid.to_string(), presence));
        Ok(())
    }
    async fn send_global_presence(&self, presence: GlobalPresence) -> Result<(), QpError> {
        self.global_presences.lock().unwrap().push(presence);
        Ok(())
    }
    async fn mark_read(
        &self,
        ids: &[String],
        chat_jid: &str,
        _sender_jid: Option<&str>,
        _receipt: MarkReadType,
    ) -> Result<(), QpError> {
        self.marked_read
            .lock()
            .unwrap()
            .push((ids.to_vec(), chat_jid.to_string()));
        Ok(())
    }
    async fn reject_call(&self, call_id: &str, _from_jid: &str) -> Result<(), QpError> {
        self.rejected_calls.lock().unwrap().push(call_id.to_string());
        Ok(())
    }
    async fn mark_chat_unread(&self, chat_jid: &str) -> Result<(), QpError> {
        self.marked_unread.lock().unwrap().push(chat_jid.to_string());
        Ok(())
    }
    async fn archive_chat(&self, chat_jid: &str, archive: bool) -> Result<(), QpError> {
        self.archived
            .lock()
            .unwrap()
            .push((chat_jid.to_string(), archive));
        Ok(())
    }
    async fn group_create(&self, name: &str, participants: &[String]) -> Result<GroupInfo, QpError> {
        Ok(GroupInfo {
            jid: "1234-5678@g.us".to_string(),
            name: name.to_string(),
            participants: participants
                .iter()
                .map(|jid| GroupParticipant {
                    jid: jid.clone(),
                    admin: false,
                })
                .collect(),
            ..Default::default()
        })
    }
    async fn group_info(&self, jid: &str) -> Result<GroupInfo, QpError> {
        let name = self
            .group_names
            .lock()
            .unwrap()
            .get(jid)
            .cloned()
            .unwrap_or_default();
        Ok(GroupInfo {
            jid: jid.to_string(),
            name,
            ..Default::default()
        })
    }
    async fn group_list(&self) -> Result<Vec<GroupInfo>, QpError> {
        Ok(Vec::new())
    }
    async fn group_set_name(&self, _jid: &str, _name: &str) -> Result<(), QpError> {
        Ok(())
    }
    async fn group_set_topic(&self, _jid: &str, _topic: &str) -> Result<(), QpError> {
        Ok(())
    }
    async fn group_set_photo(&self, _jid: &str, _jpeg: &[u8]) -> Result<(), QpError> {
        Ok(())
    }
    async fn group_update_participants(
        &self,
        _jid: &str,
        participants: &[String],
        _action: ParticipantsAction,
    ) -> Result<Vec<GroupParticipant>, QpError> {
        Ok(participants
            .iter()
            .map(|jid| GroupParticipant {
                jid: jid.clone(),
                admin: false,
            })
            .collect())
    }
    async fn group_join_requests(&self, _jid: &str) -> Result<Vec<String>, QpError> {
        Ok(Vec::new())
    }
    async fn group_handle_requests(
        &self,
        _jid: &str,
        _users: &[String],
        _approve: bool,
    ) -> Result<(), QpError> {
        Ok(())
    }
    async fn group_leave(&self, _jid: &str) -> Result<(), QpError> {
        Ok(())
    }
    async fn group_invite_link(&self, jid: &str) -> Result<String, QpError> {
        Ok(format!("https://chat.whatsapp.com/{jid}"))
    }
    async fn get_profile_picture(&self, _jid: &str) -> Result<Option<String>, QpError> {
        Ok(None)
    }
    async fn is_on_whatsapp(&self, phones: &[String]) -> Result<Vec<String>, QpError> {
        Ok(phones
            .iter()
            .map(|p| quepasa_core::jid::phone_to_jid(p))
            .collect())
    }
    async fn get_user_info(&self, jids: &[String]) -> Result<Vec<UserInfo>, QpError> {
        Ok(jids
            .iter()
            .map(|jid| UserInfo {
                jid: jid.clone(),
                ..Default::default()
            })
            .collect())
    }
    async fn contact_info(&self, jid: &str) -> Result<Option<ContactInfo>, QpError> {
        Ok(self.contacts.lock().unwrap().get(jid).cloned())
    }
    async fn all_contacts(&self) -> Result<Vec<ContactInfo>, QpError> {
        Ok(self.contacts.lock().unwrap().values().cloned().collect())
    }
    async fn lid_for_phone(&self, phone: &str) -> Result<Option<String>, QpError> {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.lid_by_phone.lock().unwrap().get(phone).cloned())
    }
    async fn phone_for_lid(&self, lid: &str) -> Result<Option<String>, QpError> {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.phone_by_lid.lock().unwrap().get(lid).cloned())
    }
    async fn group_name(&self, jid: &str) -> Result<Option<String>, QpError> {
        Ok(self.group_names.lock().unwrap().get(jid).cloned())
    }
}

/// Hands out one [`MockWcl`] and captures the tenant's event sender.
pub struct MockFactory {
    pub wcl: Arc<MockWcl>,
    pub events: Mutex<Option<mpsc::Sender<WclEvent>>>,
}

impl MockFactory {
    pub fn new(wcl: Arc<MockWcl>) -> Arc<Self> {
        Arc::new(Self {
            wcl,
            events: Mutex::new(None),
        })
    }

    /// Inject one event as if the WCL emitted it.
    pub async fn emit(&self, event: WclEvent) {
        let tx = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("tenant not started");
        tx.send(event).await.expect("event loop gone");
    }
}

#[async_trait]
impl WclFactory for MockFactory {
    async fn create(
        &self,
        _token: &str,
        events: mpsc::Sender<WclEvent>,
    ) -> Result<Arc<dyn WhatsappClient>, QpError> {
        *self.events.lock().unwrap() = Some(events);
        Ok(Arc::clone(&self.wcl) as Arc<dyn WhatsappClient>)
    }
}

/// Carrier double recording payloads per connection string.
#[derive(Default)]
pub struct RecordingCarrier {
    pub delivered: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingCarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl quepasa_dispatch::Carrier for RecordingCarrier {
    async fn deliver(
        &self,
        sub: &quepasa_dispatch::DispatchSubscription,
        payload: &serde_json::Value,
    ) -> Result<(), QpError> {
        self.delivered
            .lock()
            .unwrap()
            .push((sub.connection_string.clone(), payload.clone()));
        Ok(())
    }
}
