//! The dispatcher: fan-out of inbound events to subscribers.
//!
//! Pre-filters run once per message against the tenant-level effective
//! options; per-subscriber routing then applies the subscriber's own
//! filters. Each subscriber gets its own ordered worker: a failing
//! delivery blocks that subscriber's queue head through its retries, but
//! never other subscribers.

use crate::carrier::Carrier;
use crate::subscription::{DispatchSubscription, SubscriberKind};
use chrono::Utc;
use quepasa_core::jid;
use quepasa_core::message::{Message, MessageType};
use quepasa_core::options::{ServiceOptions, WhatsappOptions};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Called with `(message_id, error)` whenever a delivery attempt fails, so
/// the owner can append to the cached message's `exceptions`.
pub type ErrorSink = Arc<dyn Fn(&str, String) + Send + Sync>;

/// Delivery outcome for persistence of subscriber failure accounting.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub wid: String,
    pub connection_string: String,
    pub success: bool,
    pub at: chrono::DateTime<Utc>,
    pub age: u32,
}

/// Retry and failure-age knobs. The exact schedule is configurable; these
/// defaults are the sane ones.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub retry_max_attempts: u32,
    /// Consecutive failures after which the subscriber is flagged failing.
    pub max_failure_age: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(2),
            retry_cap: Duration::from_secs(120),
            retry_max_attempts: 5,
            max_failure_age: 50,
        }
    }
}

struct Job {
    sub: DispatchSubscription,
    payload: Value,
    message_id: String,
}

/// Per-tenant dispatcher.
pub struct Dispatcher {
    config: DispatcherConfig,
    service: ServiceOptions,
    webhook: Arc<dyn Carrier>,
    queue: Arc<dyn Carrier>,
    /// Live registry; workers write delivery outcomes back here so the
    /// consecutive-failure age accumulates across messages.
    subs: Arc<RwLock<Vec<DispatchSubscription>>>,
    /// One ordered worker per connection string.
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    /// (connection string, message id) pairs already routed since this
    /// process start. Redispatch bypasses this set.
    delivered: Mutex<HashSet<(String, String)>>,
    error_sink: ErrorSink,
    outcome_tx: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        service: ServiceOptions,
        webhook: Arc<dyn Carrier>,
        queue: Arc<dyn Carrier>,
        error_sink: ErrorSink,
        outcome_tx: Option<mpsc::UnboundedSender<DispatchOutcome>>,
    ) -> Self {
        Self {
            config,
            service,
            webhook,
            queue,
            subs: Arc::new(RwLock::new(Vec::new())),
            workers: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashSet::new()),
            error_sink,
            outcome_tx,
        }
    }

    // ------------------------------------------------------------------
    // Subscription registry
    // ------------------------------------------------------------------

    pub fn set_subscriptions(&self, subs: Vec<DispatchSubscription>) {
        *self.subs.write().expect("subs lock") = subs;
    }

    pub fn list(&self) -> Vec<DispatchSubscription> {
        self.subs.read().expect("subs lock").clone()
    }

    pub fn list_by_kind(&self, kind: SubscriberKind) -> Vec<DispatchSubscription> {
        self.list().into_iter().filter(|s| s.kind == kind).collect()
    }

    /// Insert or replace by connection string. Returns true on replace.
    pub fn upsert(&self, sub: DispatchSubscription) -> bool {
        let mut subs = self.subs.write().expect("subs lock");
        if let Some(existing) = subs
            .iter_mut()
            .find(|s| s.connection_string == sub.connection_string)
        {
            *existing = sub;
            true
        } else {
            subs.push(sub);
            false
        }
    }

    /// Remove by connection string. Returns the removed subscription.
    pub fn remove(&self, connection_string: &str) -> Option<DispatchSubscription> {
        let mut subs = self.subs.write().expect("subs lock");
        let idx = subs
            .iter()
            .position(|s| s.connection_string == connection_string)?;
        let removed = subs.remove(idx);
        self.workers
            .lock()
            .expect("workers lock")
            .remove(connection_string);
        Some(removed)
    }

    /// Drop all workers; queued jobs are abandoned. Used on tenant stop.
    pub fn shutdown(&self) {
        self.workers.lock().expect("workers lock").clear();
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Route one message. `is_status_update` marks read-receipt updates;
    /// `force` (redispatch) bypasses the once-per-start dedupe but never
    /// the filters.
    ///
    /// Returns how many subscribers the message was enqueued for.
    pub fn dispatch(
        &self,
        msg: &Message,
        tenant: &WhatsappOptions,
        is_status_update: bool,
        force: bool,
    ) -> usize {
        if msg.kind == MessageType::Discard {
            return 0;
        }

        let subs = self.list();

        // Pre-filters: evaluated once per message at tenant level.
        let eff = self.service.effective(tenant, &WhatsappOptions::default());
        let chat = msg.chat.id.as_str();
        if jid::is_broadcast(chat) && !eff.broadcasts {
            debug!("pre-filter drop (broadcasts) {}", msg.id);
            return 0;
        }
        if jid::is_group(chat) && !eff.groups {
            debug!("pre-filter drop (groups) {}", msg.id);
            return 0;
        }
        if (jid::is_user(chat) || jid::is_lid(chat)) && !eff.direct {
            debug!("pre-filter drop (direct) {}", msg.id);
            return 0;
        }
        if msg.kind == MessageType::Call && !eff.calls {
            debug!("pre-filter drop (calls) {}", msg.id);
            return 0;
        }
        if is_status_update && !eff.read_receipts {
            debug!("pre-filter drop (read receipts) {}", msg.id);
            return 0;
        }
        if msg.from_internal && !subs.iter().any(|s| s.forward_internal) {
            debug!("pre-filter drop (internal) {}", msg.id);
            return 0;
        }

        let mut routed = 0;
        for sub in subs {
            if !self.matches(msg, tenant, is_status_update, &sub) {
                continue;
            }

            if !force {
                let key = (sub.connection_string.clone(), msg.id.clone());
                let mut delivered = self.delivered.lock().expect("delivered lock");
                if !delivered.insert(key) {
                    continue;
                }
            }

            let payload = envelope(msg, &sub);
            self.enqueue(Job {
                message_id: msg.id.clone(),
                sub,
                payload,
            });
            routed += 1;
        }
        routed
    }

    /// Per-subscriber routing decision (after pre-filters).
    fn matches(
        &self,
        msg: &Message,
        tenant: &WhatsappOptions,
        is_status_update: bool,
        sub: &DispatchSubscription,
    ) -> bool {
        let eff = self.service.effective(tenant, &sub.options);
        let chat = msg.chat.id.as_str();

        if jid::is_broadcast(chat) && !eff.broadcasts {
            return false;
        }
        if jid::is_group(chat) && !eff.groups {
            return false;
        }
        if (jid::is_user(chat) || jid::is_lid(chat)) && !eff.direct {
            return false;
        }
        if msg.kind == MessageType::Call && !eff.calls {
            return false;
        }
        if is_status_update && !eff.read_receipts {
            return false;
        }
        if msg.from_internal && !sub.forward_internal {
            return false;
        }
        // Correlation filters: a subscriber with a track id only sees
        // exactly matching messages; a tracked message never goes back to
        // a subscriber that does not forward internals (loop breaker).
        if !sub.track_id.is_empty() && msg.track_id != sub.track_id {
            return false;
        }
        if !msg.track_id.is_empty() && !sub.forward_internal {
            return false;
        }
        true
    }

    fn enqueue(&self, job: Job) {
        let mut workers = self.workers.lock().expect("workers lock");
        let tx = workers
            .entry(job.sub.connection_string.clone())
            .or_insert_with(|| self.spawn_worker());
        if tx.send(job).is_err() {
            warn!("dispatch worker gone; job dropped");
        }
    }

    fn spawn_worker(&self) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let webhook = Arc::clone(&self.webhook);
        let queue = Arc::clone(&self.queue);
        let config = self.config.clone();
        let error_sink = Arc::clone(&self.error_sink);
        let outcome_tx = self.outcome_tx.clone();
        let subs = Arc::clone(&self.subs);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let carrier: &Arc<dyn Carrier> = match job.sub.kind {
                    SubscriberKind::Webhook => &webhook,
                    SubscriberKind::Queue => &queue,
                };

                let mut delivered = false;
                for attempt in 0..config.retry_max_attempts {
                    match carrier.deliver(&job.sub, &job.payload).await {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(e) => {
                            (error_sink)(&job.message_id, e.to_string());
                            warn!(
                                "dispatch to {} failed (attempt {}): {e}",
                                job.sub.connection_string,
                                attempt + 1
                            );
                            if attempt + 1 < config.retry_max_attempts {
                                tokio::time::sleep(backoff(&config, attempt)).await;
                            }
                        }
                    }
                }

                // The final outcome lands on the live subscription: the age
                // grows by one per exhausted message and resets on success.
                // A failing subscriber is flagged, never removed.
                let at = Utc::now();
                let age = {
                    let mut subs = subs.write().expect("subs lock");
                    match subs
                        .iter_mut()
                        .find(|s| s.connection_string == job.sub.connection_string)
                    {
                        Some(live) => {
                            if delivered {
                                live.record_success(at);
                            } else {
                                live.record_failure(at);
                                if live.is_failing(config.max_failure_age) {
                                    warn!(
                                        "subscriber {} crossed the failure age threshold ({} consecutive failures)",
                                        live.connection_string, live.age
                                    );
                                }
                            }
                            live.age
                        }
                        // Removed while the job was in flight.
                        None => {
                            if delivered {
                                0
                            } else {
                                job.sub.age.saturating_add(1)
                            }
                        }
                    }
                };

                if let Some(ref tx) = outcome_tx {
                    let _ = tx.send(DispatchOutcome {
                        wid: job.sub.wid.clone(),
                        connection_string: job.sub.connection_string.clone(),
                        success: delivered,
                        at,
                        age,
                    });
                }
            }
        });

        tx
    }
}

/// Exponential backoff: base · 2^attempt, capped.
fn backoff(config: &DispatcherConfig, attempt: u32) -> Duration {
    let exp = config.retry_base.saturating_mul(1u32 << attempt.min(16));
    exp.min(config.retry_cap)
}

/// Subscriber payload: the message object with the subscription's opaque
/// `extra` merged in as an envelope field, byte-preserving.
fn envelope(msg: &Message, sub: &DispatchSubscription) -> Value {
    let mut payload = serde_json::to_value(msg).unwrap_or(Value::Null);
    if let (Value::Object(ref mut map), Some(extra)) = (&mut payload, &sub.extra) {
        map.insert("extra".to_string(), extra.clone());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quepasa_core::error::QpError;
    use quepasa_core::message::Chat;
    use quepasa_core::options::{ServiceBool, TriState};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records payloads; optionally fails the first N attempts.
    struct MockCarrier {
        sent: Arc<Mutex<Vec<Value>>>,
        fail_first: AtomicU32,
    }

    impl MockCarrier {
        fn new() -> (Arc<Self>, Arc<Mutex<Vec<Value>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    sent: Arc::clone(&sent),
                    fail_first: AtomicU32::new(0),
                }),
                sent,
            )
        }

        fn failing_first(n: u32) -> (Arc<Self>, Arc<Mutex<Vec<Value>>>) {
            let (carrier, sent) = Self::new();
            carrier.fail_first.store(n, Ordering::SeqCst);
            (carrier, sent)
        }
    }

    #[async_trait]
    impl Carrier for MockCarrier {
        async fn deliver(&self, _sub: &DispatchSubscription, payload: &Value) -> Result<(), QpError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(QpError::Transport("boom".into()));
            }
            self.sent.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn test_dispatcher(
        service: ServiceOptions,
        webhook: Arc<dyn Carrier>,
    ) -> (Dispatcher, Arc<Mutex<Vec<(String, String)>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink_errors = Arc::clone(&errors);
        let sink: ErrorSink = Arc::new(move |id: &str, e: String| {
            sink_errors.lock().unwrap().push((id.to_string(), e));
        });
        let (unused_queue, _) = MockCarrier::new();
        let config = DispatcherConfig {
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_millis(20),
            retry_max_attempts: 3,
            max_failure_age: 10,
        };
        (
            Dispatcher::new(config, service, webhook, unused_queue, sink, None),
            errors,
        )
    }

    fn direct_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            chat: Chat::new("5511999887766@s.whatsapp.net"),
            text: "hi".into(),
            kind: MessageType::Text,
            ..Default::default()
        }
    }

    fn group_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            chat: Chat::new("123-456@g.us"),
            text: "hi group".into(),
            kind: MessageType::Text,
            ..Default::default()
        }
    }

    fn webhook_sub(url: &str) -> DispatchSubscription {
        DispatchSubscription {
            connection_string: url.to_string(),
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn group_filter_blocks_subscriber() {
        let (carrier, sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        let mut sub = webhook_sub("https://hook.example/w1");
        sub.options.groups = TriState::False;
        dispatcher.set_subscriptions(vec![sub]);

        let tenant = WhatsappOptions::default();
        assert_eq!(dispatcher.dispatch(&group_message("G1"), &tenant, false, false), 0);
        assert_eq!(dispatcher.dispatch(&direct_message("D1"), &tenant, false, false), 1);

        wait_for(|| sent.lock().unwrap().len() == 1).await;
        assert_eq!(sent.lock().unwrap()[0]["id"], "D1");
    }

    #[tokio::test]
    async fn forced_service_default_overrides_subscriber() {
        let (carrier, _sent) = MockCarrier::new();
        let service = ServiceOptions {
            groups: ServiceBool::ForcedFalse,
            ..Default::default()
        };
        let (dispatcher, _) = test_dispatcher(service, carrier);
        let mut sub = webhook_sub("https://hook.example/w1");
        sub.options.groups = TriState::True;
        dispatcher.set_subscriptions(vec![sub]);

        let mut tenant = WhatsappOptions::default();
        tenant.groups = TriState::True;
        assert_eq!(dispatcher.dispatch(&group_message("G1"), &tenant, false, false), 0);
    }

    #[tokio::test]
    async fn discard_never_dispatches() {
        let (carrier, _sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        dispatcher.set_subscriptions(vec![webhook_sub("https://hook.example/w1")]);

        let mut msg = direct_message("X1");
        msg.kind = MessageType::Discard;
        assert_eq!(
            dispatcher.dispatch(&msg, &WhatsappOptions::default(), false, false),
            0
        );
    }

    #[tokio::test]
    async fn track_id_loop_breaker() {
        let (carrier, sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        dispatcher.set_subscriptions(vec![webhook_sub("https://hook.example/w1")]);
        let tenant = WhatsappOptions::default();

        // Untracked message passes.
        assert_eq!(dispatcher.dispatch(&direct_message("A"), &tenant, false, false), 1);

        // Tracked message is suppressed for a non-forwarding subscriber.
        let mut tracked = direct_message("B");
        tracked.track_id = "x".into();
        tracked.from_internal = true;
        assert_eq!(dispatcher.dispatch(&tracked, &tenant, false, false), 0);

        wait_for(|| sent.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn track_id_filter_requires_exact_match() {
        let (carrier, _sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        let mut sub = webhook_sub("https://hook.example/w1");
        sub.track_id = "crm".into();
        sub.forward_internal = true;
        dispatcher.set_subscriptions(vec![sub]);
        let tenant = WhatsappOptions::default();

        let mut wrong = direct_message("A");
        wrong.track_id = "other".into();
        assert_eq!(dispatcher.dispatch(&wrong, &tenant, false, false), 0);

        let mut right = direct_message("B");
        right.track_id = "crm".into();
        assert_eq!(dispatcher.dispatch(&right, &tenant, false, false), 1);
    }

    #[tokio::test]
    async fn dedupe_per_start_and_redispatch_bypass() {
        let (carrier, sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        dispatcher.set_subscriptions(vec![webhook_sub("https://hook.example/w1")]);
        let tenant = WhatsappOptions::default();

        let msg = direct_message("M1");
        assert_eq!(dispatcher.dispatch(&msg, &tenant, false, false), 1);
        // Same id again: deduped.
        assert_eq!(dispatcher.dispatch(&msg, &tenant, false, false), 0);
        // Redispatch forces through.
        assert_eq!(dispatcher.dispatch(&msg, &tenant, false, true), 1);

        wait_for(|| sent.lock().unwrap().len() == 2).await;
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_reports_errors() {
        let (carrier, sent) = MockCarrier::failing_first(2);
        let (dispatcher, errors) = test_dispatcher(ServiceOptions::default(), carrier);
        dispatcher.set_subscriptions(vec![webhook_sub("https://hook.example/w1")]);

        dispatcher.dispatch(&direct_message("R1"), &WhatsappOptions::default(), false, false);

        wait_for(|| sent.lock().unwrap().len() == 1).await;
        let errs = errors.lock().unwrap();
        assert_eq!(errs.len(), 2);
        assert_eq!(errs[0].0, "R1");
    }

    #[tokio::test]
    async fn failure_age_accumulates_across_messages_and_resets_on_success() {
        let (carrier, sent) = MockCarrier::failing_first(u32::MAX);
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier.clone());
        dispatcher.set_subscriptions(vec![webhook_sub("https://hook.example/w1")]);
        let tenant = WhatsappOptions::default();

        // Each exhausted message adds exactly one to the live counter.
        for n in 1..=4u32 {
            dispatcher.dispatch(&direct_message(&format!("A{n}")), &tenant, false, false);
            wait_for(|| dispatcher.list()[0].age == n).await;
        }

        let subs = dispatcher.list();
        assert!(subs[0].is_failing(3));
        assert!(subs[0].is_failure_more_recent());
        assert!(subs[0].success.is_none());

        carrier.fail_first.store(0, Ordering::SeqCst);
        dispatcher.dispatch(&direct_message("A5"), &tenant, false, false);
        wait_for(|| dispatcher.list()[0].age == 0).await;

        let subs = dispatcher.list();
        assert!(subs[0].success.is_some());
        assert!(!subs[0].is_failing(3));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outcomes_carry_the_accumulated_age() {
        let (carrier, _sent) = MockCarrier::failing_first(u32::MAX);
        let (unused_queue, _) = MockCarrier::new();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let sink: ErrorSink = Arc::new(|_, _| {});
        let config = DispatcherConfig {
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(2),
            retry_max_attempts: 1,
            max_failure_age: 10,
        };
        let dispatcher = Dispatcher::new(
            config,
            ServiceOptions::default(),
            carrier,
            unused_queue,
            sink,
            Some(outcome_tx),
        );
        let mut sub = webhook_sub("https://hook.example/w1");
        sub.wid = "5511999887766@s.whatsapp.net".into();
        dispatcher.set_subscriptions(vec![sub]);
        let tenant = WhatsappOptions::default();

        dispatcher.dispatch(&direct_message("O1"), &tenant, false, false);
        dispatcher.dispatch(&direct_message("O2"), &tenant, false, false);

        let first = outcome_rx.recv().await.unwrap();
        let second = outcome_rx.recv().await.unwrap();
        assert!(!first.success);
        assert_eq!(first.wid, "5511999887766@s.whatsapp.net");
        assert_eq!((first.age, second.age), (1, 2));
    }

    #[tokio::test]
    async fn read_receipt_pre_filter() {
        let (carrier, _sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        dispatcher.set_subscriptions(vec![webhook_sub("https://hook.example/w1")]);

        // read_receipts defaults to false everywhere.
        let msg = direct_message("S1");
        assert_eq!(
            dispatcher.dispatch(&msg, &WhatsappOptions::default(), true, false),
            0
        );

        let mut tenant = WhatsappOptions::default();
        tenant.read_receipts = TriState::True;
        assert_eq!(dispatcher.dispatch(&msg, &tenant, true, false), 1);
    }

    #[tokio::test]
    async fn extra_is_merged_into_payload() {
        let (carrier, sent) = MockCarrier::new();
        let (dispatcher, _) = test_dispatcher(ServiceOptions::default(), carrier);
        let mut sub = webhook_sub("https://hook.example/w1");
        sub.extra = Some(serde_json::json!({"team": "support", "n": 7}));
        dispatcher.set_subscriptions(vec![sub]);

        dispatcher.dispatch(&direct_message("E1"), &WhatsappOptions::default(), false, false);

        wait_for(|| sent.lock().unwrap().len() == 1).await;
        let payload = sent.lock().unwrap()[0].clone();
        assert_eq!(payload["extra"]["team"], "support");
        assert_eq!(payload["extra"]["n"], 7);
        assert_eq!(payload["id"], "E1");
    }
}
