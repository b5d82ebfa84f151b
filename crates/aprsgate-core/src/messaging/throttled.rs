use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::port::MessagingPort,
    Result,
};

/// Outbound pacing for Telegram API calls.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Spacing between any two calls, whatever the chat.
    pub global: Duration,
    /// Spacing between two calls to the same chat.
    pub per_chat: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global: Duration::from_millis(40),
            per_chat: Duration::from_millis(1050),
        }
    }
}

/// Booked send times. A call takes the first instant free both globally and
/// for its chat; chats whose slot has passed are forgotten.
#[derive(Debug, Default)]
struct Slots {
    global_next: Option<Instant>,
    chat_next: HashMap<i64, Instant>,
}

impl Slots {
    /// Reserve a slot for `chat_id` and return how long to wait for it.
    fn book(&mut self, cfg: &ThrottleConfig, chat_id: i64, now: Instant) -> Duration {
        self.chat_next.retain(|_, next| *next > now);

        let mut at = now;
        if let Some(next) = self.global_next {
            at = at.max(next);
        }
        if let Some(&next) = self.chat_next.get(&chat_id) {
            at = at.max(next);
        }

        self.global_next = Some(at + cfg.global);
        self.chat_next.insert(chat_id, at + cfg.per_chat);
        at - now
    }
}

/// `MessagingPort` decorator that paces outbound calls.
///
/// `/listusers` fans out one message per registered user to the admin chat,
/// which is the main source of Telegram 429s for this bot.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    slots: Mutex<Slots>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            slots: Mutex::new(Slots::default()),
        }
    }

    async fn wait_turn(&self, chat_id: ChatId) {
        let wait = self
            .slots
            .lock()
            .await
            .book(&self.cfg, chat_id.0, Instant::now());
        if !wait.is_zero() {
            debug!(chat_id = chat_id.0, wait_ms = wait.as_millis() as u64, "throttling");
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.wait_turn(chat_id).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.wait_turn(msg.chat_id).await;
        self.inner.edit_html(msg, html).await
    }
}
