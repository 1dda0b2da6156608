//! Gateway service: the tenant registry and everything that spans tenants.
//!
//! Owns the store, the WCL factory and the delivery carriers; builds one
//! cache + dispatcher + event loop per tenant and keeps the persisted rows
//! in sync with the runtime registry.

use crate::cache::MessageCache;
use crate::lid::LidIndex;
use crate::presence::PresenceTimers;
use crate::tenant::Tenant;
use crate::wakeup::{ClientProvider, WakeupScheduler};
use quepasa_core::config::Config;
use quepasa_core::error::QpError;
use quepasa_core::state::ConnectionState;
use quepasa_core::wcl::{WclFactory, WhatsappClient};
use quepasa_dispatch::{
    Carrier, DispatchOutcome, DispatchSubscription, Dispatcher, DispatcherConfig, ErrorSink,
    QueueCarrier, WebhookCarrier,
};
use quepasa_store::{Store, TenantRecord};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One line of the health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthItem {
    pub token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub wid: String,
    pub state: ConnectionState,
    pub healthy: bool,
}

pub struct GatewayService {
    pub config: Config,
    pub store: Store,
    factory: Arc<dyn WclFactory>,
    webhook: Arc<dyn Carrier>,
    queue: Arc<dyn Carrier>,
    tenants: RwLock<HashMap<String, Arc<Tenant>>>,
    pub presence: PresenceTimers,
    outcome_tx: mpsc::UnboundedSender<DispatchOutcome>,
}

impl GatewayService {
    pub fn new(
        config: Config,
        store: Store,
        factory: Arc<dyn WclFactory>,
    ) -> Result<Arc<Self>, QpError> {
        let webhook = Arc::new(WebhookCarrier::new(Duration::from_secs(
            config.http.webhook_timeout,
        ))?);
        Ok(Self::with_carriers(
            config,
            store,
            factory,
            webhook,
            Arc::new(QueueCarrier),
        ))
    }

    /// Constructor with injectable carriers; the tests swap in recorders.
    pub fn with_carriers(
        config: Config,
        store: Store,
        factory: Arc<dyn WclFactory>,
        webhook: Arc<dyn Carrier>,
        queue: Arc<dyn Carrier>,
    ) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            config,
            store: store.clone(),
            factory,
            webhook,
            queue,
            tenants: RwLock::new(HashMap::new()),
            presence: PresenceTimers::new(),
            outcome_tx,
        });
        spawn_outcome_writer(store, outcome_rx);
        service
    }

    /// Rebuild the registry from the store and start every verified
    /// tenant. Lifecycle state is runtime-only, so after a restart each
    /// tenant starts over from scratch.
    pub async fn startup(self: &Arc<Self>) -> Result<(), QpError> {
        let records = self.store.list_servers().await?;
        info!("loading {} tenants from the store", records.len());

        for record in records {
            let verified = record.verified;
            let tenant = self.attach(record).await?;
            if verified {
                let factory = Arc::clone(&self.factory);
                let started = Arc::clone(&tenant);
                tokio::spawn(async move {
                    if let Err(e) = started.start(&factory).await {
                        warn!("tenant {} failed to start: {e}", started.token);
                    }
                });
            }
        }
        Ok(())
    }

    /// Build the runtime tenant for a persisted record and register it.
    async fn attach(&self, record: TenantRecord) -> Result<Arc<Tenant>, QpError> {
        let cache = Arc::new(MessageCache::new(self.config.cache.clone()));
        let sink_cache = Arc::clone(&cache);
        let sink: ErrorSink = Arc::new(move |id: &str, e: String| {
            sink_cache.append_exception(id, e);
        });

        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            self.config.whatsapp.options,
            Arc::clone(&self.webhook),
            Arc::clone(&self.queue),
            sink,
            Some(self.outcome_tx.clone()),
        ));
        if !record.wid.is_empty() {
            dispatcher.set_subscriptions(self.store.list_dispatching(&record.wid).await?);
        }

        let token = record.token.clone();
        let tenant = Tenant::new(
            record,
            cache,
            dispatcher,
            Arc::new(LidIndex::new()),
            self.config.whatsapp.clone(),
        );
        self.tenants
            .write()
            .expect("tenants lock")
            .insert(token, Arc::clone(&tenant));
        Ok(tenant)
    }

    // ------------------------------------------------------------------
    // Registry lookups
    // ------------------------------------------------------------------

    pub fn find(&self, token: &str) -> Option<Arc<Tenant>> {
        self.tenants
            .read()
            .expect("tenants lock")
            .get(token)
            .cloned()
    }

    pub fn require(&self, token: &str) -> Result<Arc<Tenant>, QpError> {
        self.find(token)
            .ok_or_else(|| QpError::NotFound(format!("server {token}")))
    }

    pub fn list(&self) -> Vec<Arc<Tenant>> {
        self.tenants
            .read()
            .expect("tenants lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_for_user(&self, user: &str) -> Vec<Arc<Tenant>> {
        self.list().into_iter().filter(|t| t.user == user).collect()
    }

    /// First tenant able to send; used by the master spam endpoint.
    pub fn first_ready(&self) -> Option<Arc<Tenant>> {
        self.list()
            .into_iter()
            .find(|t| t.state() == ConnectionState::Ready)
    }

    pub fn factory(&self) -> &Arc<dyn WclFactory> {
        &self.factory
    }

    // ------------------------------------------------------------------
    // Tenant lifecycle
    // ------------------------------------------------------------------

    /// Create a tenant for `user`, generating a token when none is given.
    pub async fn create_tenant(
        &self,
        user: &str,
        token: Option<String>,
    ) -> Result<Arc<Tenant>, QpError> {
        let token = match token {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if self.find(&token).is_some() {
            return Err(QpError::Input(format!("token already in use: {token}")));
        }

        let record = TenantRecord {
            token,
            user: user.to_string(),
            timestamp: Some(chrono::Utc::now()),
            ..Default::default()
        };
        self.store.save_server(&record).await?;
        self.attach(record).await
    }

    /// Logout the device, wipe the rows, drop the runtime tenant.
    pub async fn delete_tenant(&self, token: &str) -> Result<(), QpError> {
        let tenant = self.require(token)?;
        if let Err(e) = tenant.delete().await {
            warn!("tenant {token} teardown: {e}");
        }
        self.store.delete_server(token).await?;
        self.tenants.write().expect("tenants lock").remove(token);
        Ok(())
    }

    /// Persist the tenant's current snapshot.
    pub async fn persist(&self, tenant: &Tenant) -> Result<(), QpError> {
        self.store.save_server(&tenant.record()).await
    }

    pub async fn start_tenant(self: &Arc<Self>, token: &str) -> Result<Arc<Tenant>, QpError> {
        let tenant = self.require(token)?;
        tenant.start(&self.factory).await?;
        Ok(tenant)
    }

    pub async fn stop_tenant(&self, token: &str, reason: &str) -> Result<Arc<Tenant>, QpError> {
        let tenant = self.require(token)?;
        tenant.stop(reason).await?;
        Ok(tenant)
    }

    pub async fn restart_tenant(self: &Arc<Self>, token: &str) -> Result<Arc<Tenant>, QpError> {
        let tenant = self.require(token)?;
        tenant.restart(&self.factory).await?;
        Ok(tenant)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Insert or replace a subscription, both persisted and live.
    /// Returns true when an existing one was replaced.
    pub async fn save_subscription(
        &self,
        tenant: &Tenant,
        mut sub: DispatchSubscription,
    ) -> Result<bool, QpError> {
        sub.wid = tenant.wid();
        if sub.wid.is_empty() {
            return Err(QpError::Input(
                "server has no device id yet; pair it first".to_string(),
            ));
        }
        if sub.timestamp.is_none() {
            sub.timestamp = Some(chrono::Utc::now());
        }
        self.store.save_dispatching(&sub).await?;
        Ok(tenant.dispatcher.upsert(sub))
    }

    /// Remove a subscription, both persisted and live.
    pub async fn remove_subscription(
        &self,
        tenant: &Tenant,
        connection_string: &str,
    ) -> Result<bool, QpError> {
        let wid = tenant.wid();
        let removed_row = if wid.is_empty() {
            false
        } else {
            self.store
                .delete_dispatching(&wid, connection_string)
                .await?
        };
        let removed_live = tenant.dispatcher.remove(connection_string).is_some();
        Ok(removed_row || removed_live)
    }

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------

    /// Master-key gate. An empty configured key disables master access.
    pub fn check_master_key(&self, provided: Option<&str>) -> Result<(), QpError> {
        let key = self.config.auth.master_key.as_str();
        if key.is_empty() {
            return Err(QpError::Auth("master key disabled".to_string()));
        }
        match provided {
            Some(candidate) if constant_time_eq(candidate, key) => Ok(()),
            _ => Err(QpError::Auth("invalid master key".to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Health & wake-up
    // ------------------------------------------------------------------

    pub fn health(&self) -> Vec<HealthItem> {
        Self::health_items(self.list())
    }

    /// Health items restricted to the tenants owned by `user`.
    pub fn health_for_user(&self, user: &str) -> Vec<HealthItem> {
        Self::health_items(self.list_for_user(user))
    }

    fn health_items(tenants: Vec<Arc<Tenant>>) -> Vec<HealthItem> {
        let mut items: Vec<HealthItem> = tenants
            .into_iter()
            .map(|t| HealthItem {
                token: t.token.clone(),
                wid: t.wid(),
                state: t.state(),
                healthy: t.is_healthy(),
            })
            .collect();
        items.sort_by(|a, b| a.token.cmp(&b.token));
        items
    }

    pub fn is_healthy(&self) -> bool {
        self.health().iter().all(|item| item.healthy)
    }

    /// Clients of all `ready` tenants.
    pub fn ready_clients(&self) -> Vec<Arc<dyn WhatsappClient>> {
        self.list()
            .into_iter()
            .filter(|t| t.state() == ConnectionState::Ready)
            .filter_map(|t| t.client())
            .collect()
    }

    /// Arm the daily wake-up scheduler, when configured.
    pub fn arm_wakeup(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let weak = Arc::downgrade(self);
        let provider: ClientProvider = Arc::new(move || {
            weak.upgrade()
                .map(|service| service.ready_clients())
                .unwrap_or_default()
        });
        WakeupScheduler::from_defaults(&self.config.whatsapp, provider).map(WakeupScheduler::spawn)
    }
}

/// Persist delivery outcomes off the dispatch hot path.
fn spawn_outcome_writer(store: Store, mut rx: mpsc::UnboundedReceiver<DispatchOutcome>) {
    tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            if outcome.wid.is_empty() {
                continue;
            }
            if let Err(e) = store
                .update_dispatching_outcome(
                    &outcome.wid,
                    &outcome.connection_string,
                    outcome.success,
                    outcome.at,
                    outcome.age,
                )
                .await
            {
                error!("failed to persist dispatch outcome: {e}");
            } else {
                debug!(
                    "dispatch outcome for {}: success={}",
                    outcome.connection_string, outcome.success
                );
            }
        }
    });
}

/// Compare secrets without early exit on the first differing byte.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
