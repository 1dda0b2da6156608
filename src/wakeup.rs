//! Daily wake-up scheduler.
//!
//! Some devices throttle background delivery for accounts that never
//! announce presence. When `WAKEUP_HOUR` is set, every connected tenant
//! goes `available` once a day inside a ten-minute window after that hour,
//! then back to `unavailable` after `WAKEUP_DURATION` seconds.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use quepasa_core::config::WhatsappDefaults;
use quepasa_core::wcl::{GlobalPresence, WhatsappClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hands out the clients that should receive the presence toggle; only
/// `ready` tenants qualify.
pub type ClientProvider = Arc<dyn Fn() -> Vec<Arc<dyn WhatsappClient>> + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_secs(300);
const WINDOW: ChronoDuration = ChronoDuration::minutes(10);

/// Start of today's trigger window for `hour`.
fn window_start(now: DateTime<Utc>, hour: u8) -> Option<DateTime<Utc>> {
    now.with_hour(hour as u32)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
}

/// Whether `now` falls inside the daily trigger window for `hour`.
fn in_window(now: DateTime<Utc>, hour: u8) -> bool {
    let Some(start) = window_start(now, hour) else {
        return false;
    };
    now >= start && now < start + WINDOW
}

/// When a trigger is due, returns the next re-arm instant: the scheduled
/// window start shifted forward by 24 hours. Anchoring to the window start
/// rather than `now` keeps the next day's window fully inside the armed
/// range even when the trigger lands late in the window.
fn due_rearm(now: DateTime<Utc>, hour: u8, armed_after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if now <= armed_after || !in_window(now, hour) {
        return None;
    }
    window_start(now, hour).map(|start| start + ChronoDuration::hours(24))
}

pub struct WakeupScheduler {
    hour: u8,
    duration: Duration,
    provider: ClientProvider,
    poll: Duration,
}

impl WakeupScheduler {
    /// Returns `None` when no `WAKEUP_HOUR` is configured.
    pub fn from_defaults(defaults: &WhatsappDefaults, provider: ClientProvider) -> Option<Self> {
        defaults.wakeup_hour.map(|hour| Self {
            hour,
            duration: Duration::from_secs(defaults.wakeup_duration),
            provider,
            poll: POLL_INTERVAL,
        })
    }

    #[cfg(test)]
    fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            "wake-up scheduler armed for {:02}:00 UTC, {}s available",
            self.hour,
            self.duration.as_secs()
        );
        tokio::spawn(async move {
            // Shifted forward after each trigger so one window never fires
            // twice.
            let mut armed_after = Utc::now() - ChronoDuration::days(1);
            let mut ticker = tokio::time::interval(self.poll);
            loop {
                ticker.tick().await;
                if let Some(next) = due_rearm(Utc::now(), self.hour, armed_after) {
                    armed_after = next;
                    self.trigger().await;
                }
            }
        })
    }

    async fn trigger(&self) {
        let clients = (self.provider)();
        debug!("wake-up trigger for {} connected tenants", clients.len());
        for client in clients {
            if let Err(e) = client.send_global_presence(GlobalPresence::Available).await {
                warn!("wake-up presence failed: {e}");
                continue;
            }
            let duration = self.duration;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Err(e) = client
                    .send_global_presence(GlobalPresence::Unavailable)
                    .await
                {
                    debug!("wake-up wind-down failed: {e}");
                }
            });
        }
    }
}
