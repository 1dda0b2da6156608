//! Chat-presence timers.
//!
//! One running task per chat (key uppercased). A new presence for the
//! same chat cancels the prior task, and a cancelled task never emits its
//! trailing `paused` — the new presence is the cancellation.

use quepasa_core::error::QpError;
use quepasa_core::wcl::{ChatPresence, WhatsappClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Request classes accepted by `/chat/presence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Paused,
    Text,
    Audio,
}

impl PresenceKind {
    pub fn parse(token: &str) -> Result<Self, QpError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "paused" => Ok(PresenceKind::Paused),
            "text" => Ok(PresenceKind::Text),
            "audio" => Ok(PresenceKind::Audio),
            other => Err(QpError::Input(format!("unknown presence type: {other}"))),
        }
    }

    fn indicator(self) -> ChatPresence {
        match self {
            PresenceKind::Paused => ChatPresence::Paused,
            PresenceKind::Text => ChatPresence::Composing,
            PresenceKind::Audio => ChatPresence::Recording,
        }
    }
}

pub struct PresenceTimers {
    /// Uppercased chat id → cancellation flag of the running task.
    tasks: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    /// Cancellation poll interval.
    tick: Duration,
}

impl Default for PresenceTimers {
    fn default() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            tick: Duration::from_millis(500),
        }
    }
}

impl PresenceTimers {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_tick(tick: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            tick,
        }
    }

    /// Apply one presence request. Serialized per chat; independent across
    /// chats.
    pub async fn set(
        &self,
        client: Arc<dyn WhatsappClient>,
        chat_id: &str,
        kind: PresenceKind,
        duration: Duration,
    ) -> Result<(), QpError> {
        let key = chat_id.to_ascii_uppercase();

        // Cancel the prior task for this chat; it must not emit its
        // trailing paused.
        if let Some(prior) = self.tasks.lock().expect("presence lock").remove(&key) {
            prior.store(true, Ordering::SeqCst);
        }

        if kind == PresenceKind::Paused {
            client.send_chat_presence(chat_id, ChatPresence::Paused).await?;
            return Ok(());
        }

        client.send_chat_presence(chat_id, kind.indicator()).await?;

        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks
            .lock()
            .expect("presence lock")
            .insert(key.clone(), Arc::clone(&cancelled));

        let tasks = Arc::clone(&self.tasks);
        let tick = self.tick;
        let chat = chat_id.to_string();
        let flag = Arc::clone(&cancelled);
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + duration;
            loop {
                tokio::time::sleep(tick).await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }

            // Deregister before sending so a racing new presence for the
            // same chat does not cancel a task that already finished.
            let ours = {
                let mut map = tasks.lock().expect("presence lock");
                match map.get(&chat.to_ascii_uppercase()) {
                    Some(current) if Arc::ptr_eq(current, &flag) => {
                        map.remove(&chat.to_ascii_uppercase());
                        true
                    }
                    _ => false,
                }
            };
            if !ours || flag.load(Ordering::SeqCst) {
                return;
            }

            if let Err(e) = client.send_chat_presence(&chat, ChatPresence::Paused).await {
                debug!("trailing paused for {chat} failed: {e}");
            }
        });

        Ok(())
    }
}
