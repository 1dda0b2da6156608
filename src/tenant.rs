//! One logical WhatsApp session: identity, tri-state options, lifecycle
//! state machine, WCL adapter, message cache and dispatcher.
//!
//! The WCL serializes event delivery per tenant, so the event handlers
//! never lock against each other; locks here only guard against the HTTP
//! surface reading concurrently.

use crate::cache::MessageCache;
use crate::lid::LidIndex;
use crate::translate;
use chrono::{DateTime, Utc};
use quepasa_core::config::WhatsappDefaults;
use quepasa_core::error::QpError;
use quepasa_core::message::{Chat, Message, MessageStatus, MessageType};
use quepasa_core::options::WhatsappOptions;
use quepasa_core::state::ConnectionState;
use quepasa_core::wcl::{
    EventMessage, EventReceipt, MarkReadType, MessageContent, ReceiptType, SendAttachment,
    SendPayload, WclEvent, WclFactory, WhatsappClient,
};
use quepasa_dispatch::Dispatcher;
use quepasa_store::TenantRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bounded wait on the initial socket bring-up; login completion arrives
/// as a Connected event.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamps {
    pub created: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub update: Option<DateTime<Utc>>,
}

/// Outbound send request, already validated at the HTTP boundary.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub chat_id: String,
    pub text: String,
    pub track_id: String,
    pub attachment: Option<SendAttachment>,
    pub poll: Option<quepasa_core::message::Poll>,
    pub in_reply_id: Option<String>,
}

pub struct Tenant {
    pub token: String,
    pub user: String,
    wid: RwLock<String>,
    verified: AtomicBool,
    devel: AtomicBool,
    options: RwLock<WhatsappOptions>,
    state: RwLock<ConnectionState>,
    timestamps: Mutex<Timestamps>,
    pub cache: Arc<MessageCache>,
    pub dispatcher: Arc<Dispatcher>,
    lids: Arc<LidIndex>,
    defaults: WhatsappDefaults,
    client: RwLock<Option<Arc<dyn WhatsappClient>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes concurrent Starts.
    start_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("token", &self.token)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Tenant {
    pub fn new(
        record: TenantRecord,
        cache: Arc<MessageCache>,
        dispatcher: Arc<Dispatcher>,
        lids: Arc<LidIndex>,
        defaults: WhatsappDefaults,
    ) -> Arc<Self> {
        let initial = if record.verified {
            ConnectionState::Disconnected
        } else {
            ConnectionState::UnVerified
        };
        Arc::new(Self {
            token: record.token,
            user: record.user,
            wid: RwLock::new(record.wid),
            verified: AtomicBool::new(record.verified),
            devel: AtomicBool::new(record.devel),
            options: RwLock::new(record.options),
            state: RwLock::new(initial),
            timestamps: Mutex::new(Timestamps {
                created: record.timestamp,
                ..Default::default()
            }),
            cache,
            dispatcher,
            lids,
            defaults,
            client: RwLock::new(None),
            event_task: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // Identity & status
    // ------------------------------------------------------------------

    pub fn wid(&self) -> String {
        self.wid.read().expect("wid lock").clone()
    }

    pub fn verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn devel(&self) -> bool {
        self.devel.load(Ordering::SeqCst)
    }

    pub fn toggle_devel(&self) -> bool {
        !self.devel.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn options(&self) -> WhatsappOptions {
        *self.options.read().expect("options lock")
    }

    pub fn set_options(&self, options: WhatsappOptions) {
        *self.options.write().expect("options lock") = options;
        self.touch();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().expect("state lock")
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = {
            let mut guard = self.state.write().expect("state lock");
            std::mem::replace(&mut *guard, state)
        };
        if previous != state {
            info!("tenant {}: {previous} -> {state}", self.token);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    pub fn timestamps(&self) -> Timestamps {
        *self.timestamps.lock().expect("timestamps lock")
    }

    fn touch(&self) {
        self.timestamps.lock().expect("timestamps lock").update = Some(Utc::now());
    }

    /// Persistable snapshot of the tenant.
    pub fn record(&self) -> TenantRecord {
        TenantRecord {
            token: self.token.clone(),
            wid: self.wid(),
            user: self.user.clone(),
            verified: self.verified(),
            devel: self.devel(),
            options: self.options(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn client(&self) -> Option<Arc<dyn WhatsappClient>> {
        self.client.read().expect("client lock").clone()
    }

    /// The connection, available only in `ready` state.
    pub fn require_ready(&self) -> Result<Arc<dyn WhatsappClient>, QpError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(QpError::NotReady(state.to_string()));
        }
        self.client()
            .ok_or_else(|| QpError::NotReady(state.to_string()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Acquire the adapter, register the event loop and connect.
    /// Idempotent on `ready`/`connecting`; concurrent calls serialize.
    pub async fn start(self: &Arc<Self>, factory: &Arc<dyn WclFactory>) -> Result<(), QpError> {
        let _serialized = self.start_lock.lock().await;

        match self.state() {
            ConnectionState::Ready | ConnectionState::Connecting | ConnectionState::Connected => {
                return Ok(());
            }
            _ => {}
        }
        self.set_state(ConnectionState::Starting);
        self.timestamps.lock().expect("timestamps lock").start = Some(Utc::now());

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = factory.create(&self.token, tx).await?;
        client.set_auto_reconnect(true);
        *self.client.write().expect("client lock") = Some(Arc::clone(&client));

        let task = self.spawn_event_loop(rx);
        if let Some(previous) = self.event_task.lock().expect("task lock").replace(task) {
            previous.abort();
        }

        self.set_state(ConnectionState::Connecting);
        match tokio::time::timeout(CONNECT_WAIT, client.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(_) => {
                // Socket bring-up is still in flight; the Connected event
                // settles the state either way.
                debug!("tenant {}: connect still pending", self.token);
                Ok(())
            }
        }
    }

    /// Close the socket, keep credentials. A later Start resumes.
    pub async fn stop(&self, reason: &str) -> Result<(), QpError> {
        info!("tenant {} stopping: {reason}", self.token);
        self.set_state(ConnectionState::Stopping);

        if let Some(client) = self.client() {
            client.set_auto_reconnect(false);
            if let Err(e) = client.disconnect().await {
                warn!("tenant {} disconnect failed: {e}", self.token);
            }
        }
        self.dispatcher.shutdown();
        if let Some(task) = self.event_task.lock().expect("task lock").take() {
            task.abort();
        }
        self.set_state(ConnectionState::Stopped);
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, factory: &Arc<dyn WclFactory>) -> Result<(), QpError> {
        self.set_state(ConnectionState::Restarting);
        self.stop("restart").await?;
        self.set_state(ConnectionState::UnPrepared);
        self.start(factory).await
    }

    /// Logout at the WCL (erasing device credentials) and release local
    /// resources. Registry and store removal belong to the service.
    pub async fn delete(&self) -> Result<(), QpError> {
        self.set_state(ConnectionState::Halting);
        if let Some(client) = self.client() {
            client.set_auto_reconnect(false);
            if let Err(e) = client.logout().await {
                warn!("tenant {} logout failed: {e}", self.token);
            }
        }
        if let Some(task) = self.event_task.lock().expect("task lock").take() {
            task.abort();
        }
        self.dispatcher.shutdown();
        self.cache.clear();
        *self.client.write().expect("client lock") = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a message. Requires `ready`; applies the LID routing rule;
    /// caches and dispatches the internal record.
    pub async fn send(&self, request: SendRequest) -> Result<Message, QpError> {
        let client = self.require_ready()?;

        let chat_id = quepasa_core::jid::normalize_chat_id(&request.chat_id)
            .map_err(QpError::Input)?;
        let routed = self.lids.route_chat(&client, &chat_id).await;

        // Reply context from the cache when we still hold the original.
        let in_reply_text = request
            .in_reply_id
            .as_deref()
            .and_then(|id| self.cache.get(id))
            .map(|original| original.text);

        let kind = match &request.attachment {
            Some(a) if a.mime.starts_with("image/") => MessageType::Image,
            Some(a) if a.mime.starts_with("audio/") => MessageType::Audio,
            Some(a) if a.mime.starts_with("video/") => MessageType::Video,
            Some(_) => MessageType::Document,
            None if request.poll.is_some() => MessageType::Poll,
            None => MessageType::Text,
        };

        let attachment = request.attachment.clone();
        let response = client
            .send(SendPayload {
                chat_jid: routed.clone(),
                text: request.text.clone(),
                attachment: request.attachment,
                poll: request.poll.clone(),
                in_reply_id: request.in_reply_id.clone(),
                in_reply_text,
            })
            .await?;

        let message = Message {
            id: response.id,
            track_id: request.track_id,
            timestamp: response.timestamp,
            kind,
            chat: Chat::new(&routed),
            text: request.text,
            attachment: attachment.map(|a| quepasa_core::message::Attachment {
                mime: a.mime,
                file_length: a.content.len() as u64,
                file_name: a.file_name,
                content: Some(a.content),
                ptt: a.ptt,
                seconds: a.seconds,
                ..Default::default()
            }),
            poll: request.poll,
            in_reply: request.in_reply_id.map(|id| quepasa_core::message::InReply {
                id,
                ..Default::default()
            }),
            from_me: true,
            from_internal: true,
            status: MessageStatus::Imported,
            ..Default::default()
        };

        self.cache.append(message.clone());
        self.dispatch(&message, false, false);
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub fn dispatch(&self, message: &Message, is_status_update: bool, force: bool) -> usize {
        let options = self.options();
        self.dispatcher
            .dispatch(message, &options, is_status_update, force)
    }

    /// Re-run the full pre-filter and routing for one cached message.
    pub fn redispatch(&self, id: &str) -> Result<usize, QpError> {
        let message = self
            .cache
            .get(id)
            .ok_or_else(|| QpError::NotFound(format!("message {id}")))?;
        Ok(self.dispatch(&message, false, true))
    }

    fn spawn_event_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<WclEvent>) -> JoinHandle<()> {
        let tenant = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tenant.handle_event(event).await;
            }
            debug!("tenant {} event loop finished", tenant.token);
        })
    }

    /// One event, any outcome: errors are logged, the loop continues.
    async fn handle_event(self: &Arc<Self>, event: WclEvent) {
        match event {
            WclEvent::Message(boxed) => self.handle_message(&boxed, false).await,
            WclEvent::Receipt(receipt) => self.handle_receipt(&receipt),
            WclEvent::CallOffer {
                call_id,
                from_jid,
                timestamp,
            } => self.handle_call(&call_id, &from_jid, timestamp).await,
            WclEvent::CallNotice { call_id, .. } => {
                debug!("tenant {}: call notice {call_id}", self.token);
            }
            WclEvent::Connected { wid } => {
                *self.wid.write().expect("wid lock") = wid;
                self.verified.store(true, Ordering::SeqCst);
                self.set_state(ConnectionState::Ready);
                self.touch();
            }
            WclEvent::PairSuccess { wid } => {
                info!("tenant {} paired as {wid}", self.token);
                *self.wid.write().expect("wid lock") = wid;
                self.verified.store(true, Ordering::SeqCst);
                self.touch();
            }
            WclEvent::Disconnected { reason } => {
                match self.state() {
                    ConnectionState::Stopping
                    | ConnectionState::Stopped
                    | ConnectionState::Halting
                    | ConnectionState::Failed => {}
                    _ => {
                        warn!("tenant {} disconnected: {reason}", self.token);
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
            WclEvent::LoggedOut { reason } => self.handle_logged_out(&reason),
            WclEvent::HistorySync { messages, progress } => {
                self.handle_history(messages, progress).await;
            }
            WclEvent::JoinedGroup { jid, subject } => {
                debug!("tenant {} joined group {jid} ({subject})", self.token);
            }
            WclEvent::Contact { jid, .. } => {
                debug!("tenant {}: contact update {jid}", self.token);
            }
            WclEvent::PushNameSetting(name) => {
                debug!("tenant {}: push name {name}", self.token);
            }
            WclEvent::AppStateSyncComplete => {
                if self.state() == ConnectionState::Fetching {
                    self.set_state(ConnectionState::Ready);
                }
            }
            WclEvent::Unknown { tag, .. } => {
                debug!("tenant {}: ignoring event {tag}", self.token);
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, event: &EventMessage, from_history: bool) {
        let Some(client) = self.client() else {
            return;
        };

        // Edits update the original record in place.
        if let MessageContent::Edit { target_id, text } = &event.content {
            let updated = self.cache.with_mut(target_id, |original| {
                original.text = text.clone();
                original.edited = true;
            });
            if updated {
                if let Some(message) = self.cache.get(target_id) {
                    self.dispatch(&message, false, true);
                }
            } else {
                debug!("tenant {}: edit for unknown {target_id}", self.token);
            }
            return;
        }

        let message =
            translate::translate(event, &client, &self.lids, &self.cache, from_history).await;
        let synopsis = message.synopsis(self.cache.synopsis_length());
        debug!(
            "tenant {}: {} {} {synopsis:?}",
            self.token, message.kind, message.id
        );

        let kind = message.kind;
        self.cache.append(message.clone());
        if kind == MessageType::Discard {
            return;
        }

        // Auto-acknowledge inbound direct traffic when read updates are on.
        if !from_history && !message.from_me {
            let eff = self
                .defaults
                .options
                .effective(&self.options(), &WhatsappOptions::default());
            if eff.read_update {
                if let Err(e) = client
                    .mark_read(
                        &[message.id.clone()],
                        &message.chat.id,
                        message.participant.as_ref().map(|p| p.id.as_str()),
                        MarkReadType::Read,
                    )
                    .await
                {
                    debug!("tenant {}: auto mark-read failed: {e}", self.token);
                }
            }
        }

        self.dispatch(&message, false, false);
    }

    fn handle_receipt(&self, receipt: &EventReceipt) {
        let status = match receipt.receipt {
            ReceiptType::Delivered => MessageStatus::Delivered,
            ReceiptType::Read | ReceiptType::ReadSelf => MessageStatus::Read,
        };
        let is_read = status == MessageStatus::Read;

        for id in &receipt.ids {
            match self.cache.advance_status(id, status) {
                Some(true) => {
                    if let Some(message) = self.cache.get(id) {
                        self.dispatch(&message, is_read, true);
                    }
                }
                Some(false) => {
                    debug!("tenant {}: stale receipt for {id}", self.token);
                }
                None => {
                    debug!("tenant {}: receipt for unknown {id}", self.token);
                }
            }
        }
    }

    async fn handle_call(self: &Arc<Self>, call_id: &str, from_jid: &str, at: DateTime<Utc>) {
        let Some(client) = self.client() else {
            return;
        };

        let chat = translate::resolve_chat(&client, &self.lids, from_jid).await;
        let message = Message {
            id: call_id.to_string(),
            timestamp: at,
            kind: MessageType::Call,
            chat,
            text: "call offer".to_string(),
            status: MessageStatus::Imported,
            ..Default::default()
        };
        self.cache.append(message.clone());

        let eff = self
            .defaults
            .options
            .effective(&self.options(), &WhatsappOptions::default());
        if !eff.calls {
            if let Err(e) = client.reject_call(call_id, from_jid).await {
                warn!("tenant {}: call reject failed: {e}", self.token);
            }
            return;
        }
        self.dispatch(&message, false, false);
    }

    fn handle_logged_out(&self, reason: &str) {
        warn!("tenant {} logged out: {reason}", self.token);
        self.set_state(ConnectionState::Failed);

        let id = format!("system-logout-{}", Utc::now().timestamp());
        let message = translate::system_message(
            &id,
            &self.wid(),
            &format!("device logged out: {reason}"),
        );
        self.cache.append(message.clone());
        self.dispatch(&message, false, false);
    }

    async fn handle_history(self: &Arc<Self>, messages: Vec<EventMessage>, progress: Option<u32>) {
        debug!(
            "tenant {}: history chunk of {} (progress {progress:?})",
            self.token,
            messages.len()
        );
        if self.state() == ConnectionState::Ready {
            self.set_state(ConnectionState::Fetching);
        }

        for event in &messages {
            if !crate::history::within_sync_window(event, self.defaults.history_sync_days) {
                continue;
            }
            self.handle_message(event, true).await;
        }

        if self.state() == ConnectionState::Fetching {
            self.set_state(ConnectionState::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockFactory, MockWcl, RecordingCarrier};
    use quepasa_core::config::CacheConfig;
    use quepasa_core::options::{ServiceOptions, TriState};
    use quepasa_dispatch::{DispatchSubscription, DispatcherConfig, ErrorSink};

    struct Fixture {
        tenant: Arc<Tenant>,
        factory: Arc<MockFactory>,
        wcl: Arc<MockWcl>,
        webhook: Arc<RecordingCarrier>,
    }

    fn fixture_with(service: ServiceOptions, subs: Vec<DispatchSubscription>) -> Fixture {
        let wcl = MockWcl::new();
        let factory = MockFactory::new(Arc::clone(&wcl));
        let cache = Arc::new(MessageCache::new(CacheConfig::default()));

        let webhook = RecordingCarrier::new();
        let queue = RecordingCarrier::new();
        let sink_cache = Arc::clone(&cache);
        let sink: ErrorSink = Arc::new(move |id: &str, e: String| {
            sink_cache.append_exception(id, e);
        });
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            service,
            webhook.clone(),
            queue,
            sink,
            None,
        ));
        dispatcher.set_subscriptions(subs);

        let tenant = Tenant::new(
            TenantRecord {
                token: "tok-1".into(),
                user: "owner@example.org".into(),
                ..Default::default()
            },
            cache,
            dispatcher,
            Arc::new(LidIndex::new()),
            WhatsappDefaults::default(),
        );
        Fixture {
            tenant,
            factory,
            wcl,
            webhook,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            ServiceOptions::default(),
            vec![DispatchSubscription {
                connection_string: "https://hook.example/w1".into(),
                ..Default::default()
            }],
        )
    }

    fn text_event(id: &str, chat: &str, text: &str) -> WclEvent {
        WclEvent::Message(Box::new(EventMessage {
            id: id.to_string(),
            timestamp: Utc::now(),
            chat_jid: chat.to_string(),
            sender_jid: chat.to_string(),
            from_me: false,
            push_name: None,
            content: MessageContent::Text(text.to_string()),
            quoted_id: None,
        }))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn start_connects_and_ready_on_connected_event() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();

        fx.tenant.start(&factory).await.unwrap();
        assert_eq!(fx.tenant.state(), ConnectionState::Connecting);
        assert!(fx.wcl.auto_reconnect.load(Ordering::SeqCst));

        fx.factory
            .emit(WclEvent::Connected {
                wid: "5511999887766:2@s.whatsapp.net".into(),
            })
            .await;
        settle().await;
        assert_eq!(fx.tenant.state(), ConnectionState::Ready);
        assert!(fx.tenant.verified());
        assert!(fx.tenant.is_healthy());

        // Idempotent while ready.
        fx.tenant.start(&factory).await.unwrap();
        assert_eq!(fx.tenant.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn stop_disables_auto_reconnect_and_keeps_credentials() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(WclEvent::Connected { wid: "w@x".into() })
            .await;
        settle().await;

        fx.tenant.stop("operator request").await.unwrap();
        assert_eq!(fx.tenant.state(), ConnectionState::Stopped);
        assert!(!fx.wcl.auto_reconnect.load(Ordering::SeqCst));
        assert!(!fx.wcl.logged_out.load(Ordering::SeqCst));
        // Stopped counts as healthy.
        assert!(fx.tenant.is_healthy());
    }

    #[tokio::test]
    async fn inbound_message_is_cached_and_dispatched() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(WclEvent::Connected { wid: "w@x".into() })
            .await;
        fx.factory
            .emit(text_event("M1", "5511999887766@s.whatsapp.net", "hello"))
            .await;
        settle().await;

        let cached = fx.tenant.cache.get("M1").unwrap();
        assert_eq!(cached.text, "hello");
        assert_eq!(cached.status, MessageStatus::Imported);
        assert_eq!(fx.webhook.count(), 1);
    }

    #[tokio::test]
    async fn group_messages_filtered_when_tenant_disables_groups() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        let mut options = fx.tenant.options();
        options.groups = TriState::False;
        fx.tenant.set_options(options);

        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(text_event("G1", "123-456@g.us", "group text"))
            .await;
        fx.factory
            .emit(text_event("D1", "5511999887766@s.whatsapp.net", "direct"))
            .await;
        settle().await;

        // Both cached; only the direct one dispatched, and the filtered
        // one carries no dispatch error.
        assert!(fx.tenant.cache.get("G1").is_some());
        assert!(fx.tenant.cache.get("G1").unwrap().exceptions.is_empty());
        assert_eq!(fx.webhook.count(), 1);
        assert_eq!(fx.webhook.delivered.lock().unwrap()[0].1["id"], "D1");
    }

    #[tokio::test]
    async fn receipts_advance_status_monotonically() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(text_event("R1", "5511999887766@s.whatsapp.net", "x"))
            .await;
        settle().await;

        let receipt = |r| {
            WclEvent::Receipt(EventReceipt {
                ids: vec!["R1".into()],
                chat_jid: "5511999887766@s.whatsapp.net".into(),
                sender_jid: None,
                receipt: r,
                timestamp: Utc::now(),
            })
        };
        fx.factory.emit(receipt(ReceiptType::Delivered)).await;
        fx.factory.emit(receipt(ReceiptType::Read)).await;
        fx.factory.emit(receipt(ReceiptType::Delivered)).await;
        settle().await;

        assert_eq!(
            fx.tenant.cache.get("R1").unwrap().status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn logout_fails_tenant_and_emits_system_message() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(WclEvent::Connected { wid: "w@x".into() })
            .await;
        fx.factory
            .emit(WclEvent::LoggedOut {
                reason: "device removed".into(),
            })
            .await;
        settle().await;

        assert_eq!(fx.tenant.state(), ConnectionState::Failed);
        assert!(!fx.tenant.is_healthy());
        let delivered = fx.webhook.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["type"], "system");
    }

    #[tokio::test]
    async fn edits_update_the_cached_original() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(text_event("E1", "5511999887766@s.whatsapp.net", "typo"))
            .await;
        settle().await;

        fx.factory
            .emit(WclEvent::Message(Box::new(EventMessage {
                id: "E2".into(),
                timestamp: Utc::now(),
                chat_jid: "5511999887766@s.whatsapp.net".into(),
                sender_jid: "5511999887766@s.whatsapp.net".into(),
                from_me: false,
                push_name: None,
                content: MessageContent::Edit {
                    target_id: "E1".into(),
                    text: "fixed".into(),
                },
                quoted_id: None,
            })))
            .await;
        settle().await;

        let cached = fx.tenant.cache.get("E1").unwrap();
        assert_eq!(cached.text, "fixed");
        assert!(cached.edited);
    }

    #[tokio::test]
    async fn rejected_calls_when_calls_disabled() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        let mut options = fx.tenant.options();
        options.calls = TriState::False;
        fx.tenant.set_options(options);

        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(WclEvent::CallOffer {
                call_id: "CALL1".into(),
                from_jid: "5511999887766@s.whatsapp.net".into(),
                timestamp: Utc::now(),
            })
            .await;
        settle().await;

        assert_eq!(fx.wcl.rejected_calls.lock().unwrap().as_slice(), ["CALL1"]);
        assert_eq!(fx.webhook.count(), 0);
        // Still observable in the cache.
        assert!(fx.tenant.cache.get("CALL1").is_some());
    }

    #[tokio::test]
    async fn send_applies_lid_routing_and_caches_internal_record() {
        let fx = fixture();
        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.wcl.map_lid("5511999887766", "98765@lid");

        fx.tenant.start(&factory).await.unwrap();
        fx.factory
            .emit(WclEvent::Connected { wid: "w@x".into() })
            .await;
        settle().await;

        let sent = fx
            .tenant
            .send(SendRequest {
                chat_id: "98765@lid".into(),
                text: "routed".into(),
                track_id: "crm".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        // LID resolved back to the phone JID.
        assert_eq!(sent.chat.id, "5511999887766@s.whatsapp.net");
        assert!(sent.from_internal);
        assert!(fx.tenant.cache.get(&sent.id).is_some());
        assert_eq!(
            fx.wcl.sent.lock().unwrap()[0].chat_jid,
            "5511999887766@s.whatsapp.net"
        );
        // Tracked internal message, subscriber does not forward internals.
        assert_eq!(fx.webhook.count(), 0);
    }

    #[tokio::test]
    async fn send_requires_ready() {
        let fx = fixture();
        let err = fx
            .tenant
            .send(SendRequest {
                chat_id: "5511999887766".into(),
                text: "x".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QpError::NotReady(_)));
    }

    #[tokio::test]
    async fn history_sync_respects_the_day_window() {
        let mut fx = fixture();
        // Rebuild tenant with a 7-day window.
        let defaults = WhatsappDefaults {
            history_sync_days: Some(7),
            ..Default::default()
        };
        fx = {
            let wcl = fx.wcl;
            let factory = MockFactory::new(Arc::clone(&wcl));
            let cache = Arc::new(MessageCache::new(CacheConfig::default()));
            let webhook = RecordingCarrier::new();
            let sink_cache = Arc::clone(&cache);
            let sink: ErrorSink = Arc::new(move |id: &str, e: String| {
                sink_cache.append_exception(id, e);
            });
            let dispatcher = Arc::new(Dispatcher::new(
                DispatcherConfig::default(),
                ServiceOptions::default(),
                webhook.clone(),
                RecordingCarrier::new(),
                sink,
                None,
            ));
            dispatcher.set_subscriptions(vec![DispatchSubscription {
                connection_string: "https://hook.example/w1".into(),
                ..Default::default()
            }]);
            let tenant = Tenant::new(
                TenantRecord {
                    token: "tok-1".into(),
                    user: "owner@example.org".into(),
                    ..Default::default()
                },
                cache,
                dispatcher,
                Arc::new(LidIndex::new()),
                defaults,
            );
            Fixture {
                tenant,
                factory,
                wcl,
                webhook,
            }
        };

        let factory: Arc<dyn WclFactory> = fx.factory.clone();
        fx.tenant.start(&factory).await.unwrap();

        let event = |id: &str, age_days: i64| EventMessage {
            id: id.to_string(),
            timestamp: Utc::now() - chrono::Duration::days(age_days),
            chat_jid: "5511999887766@s.whatsapp.net".into(),
            sender_jid: "5511999887766@s.whatsapp.net".into(),
            from_me: false,
            push_name: None,
            content: MessageContent::Text(format!("history {id}")),
            quoted_id: None,
        };
        fx.factory
            .emit(WclEvent::HistorySync {
                messages: vec![event("H_OLD", 30), event("H_NEW", 2)],
                progress: Some(50),
            })
            .await;
        settle().await;

        assert!(fx.tenant.cache.get("H_OLD").is_none());
        let kept = fx.tenant.cache.get("H_NEW").unwrap();
        assert!(kept.from_history);
        assert_eq!(fx.webhook.count(), 1);
    }
}
