//! Location shares from chat users: one-shot positions and live sessions.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    commands::UNAUTHORIZED_MESSAGE,
    domain::{ChatId, UserId},
    formatting::{aprs_fi_link, escape_html, format_datetime, format_duration},
    messaging::{port::MessagingPort, types::LocationMessage},
    relay::{LocationEvent, LocationRelay, RelayOutcome},
    store::UserStore,
    Result,
};

#[derive(Clone, Copy, Debug)]
struct LiveSession {
    chat_id: ChatId,
    ends_at: DateTime<Utc>,
}

pub struct LocationService {
    store: Arc<UserStore>,
    relay: Arc<LocationRelay>,
    messenger: Arc<dyn MessagingPort>,
    sessions: Mutex<HashMap<UserId, LiveSession>>,
}

impl LocationService {
    pub fn new(
        store: Arc<UserStore>,
        relay: Arc<LocationRelay>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            store,
            relay,
            messenger,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle_location(&self, msg: LocationMessage) -> Result<()> {
        if !self.store.is_approved(msg.user_id).await {
            // Live updates arrive every few seconds; answer only the first share.
            if !msg.is_update {
                self.messenger
                    .send_html(msg.chat_id, UNAUTHORIZED_MESSAGE)
                    .await?;
            }
            return Ok(());
        }

        match msg.live_period {
            Some(period) => self.handle_live(&msg, period).await,
            None if msg.is_update => {
                self.relay.submit(event_of(&msg)).await;
                Ok(())
            }
            None => self.handle_single(&msg).await,
        }
    }

    async fn handle_live(&self, msg: &LocationMessage, period: Duration) -> Result<()> {
        let ends_at = msg.sent_at
            + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());
        if ends_at <= msg.received_at {
            debug!(user_id = msg.user_id.0, "update for an expired live share ignored");
            return Ok(());
        }

        let started = {
            let mut sessions = self.sessions.lock().await;
            let existed = sessions
                .insert(
                    msg.user_id,
                    LiveSession {
                        chat_id: msg.chat_id,
                        ends_at,
                    },
                )
                .is_some();
            !existed && !msg.is_update
        };

        let outcome = self.relay.submit(event_of(msg)).await;
        debug!(user_id = msg.user_id.0, ?outcome, "live location processed");

        if !started {
            return Ok(());
        }

        info!(user_id = msg.user_id.0, %ends_at, "live tracking started");
        let interval = self
            .store
            .get(msg.user_id)
            .await
            .map(|u| u.min_interval_seconds)
            .unwrap_or_default();
        let mut body = format!(
            "Started live location tracking\n\n\
Beacon interval: <code>{interval}s</code>\n\
Until: <code>{} UTC</code>",
            format_datetime(&ends_at)
        );
        if !outcome.is_forwarded() {
            body.push_str("\n\n");
            body.push_str(&outcome_message(&outcome));
        }
        self.messenger.send_html(msg.chat_id, &body).await?;
        Ok(())
    }

    async fn handle_single(&self, msg: &LocationMessage) -> Result<()> {
        let outcome = self.relay.submit(event_of(msg)).await;
        self.messenger
            .send_html(msg.chat_id, &outcome_message(&outcome))
            .await?;

        let stopped = self.sessions.lock().await.remove(&msg.user_id);
        if stopped.is_some() {
            info!(user_id = msg.user_id.0, "live tracking replaced by a single position");
            self.messenger
                .send_html(msg.chat_id, "Beaconing was stopped")
                .await?;
        }
        Ok(())
    }

    /// End every session whose live period is over. Returns the users affected.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Vec<UserId> {
        let expired: Vec<(UserId, LiveSession)> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<UserId> = sessions
                .iter()
                .filter(|(_, s)| s.ends_at <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };

        for (user_id, session) in &expired {
            info!(user_id = user_id.0, "live tracking ended");
            if let Err(e) = self
                .messenger
                .send_html(session.chat_id, "Live location sharing ended")
                .await
            {
                warn!(user_id = user_id.0, error = %e, "failed to notify end of live sharing");
            }
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Periodically expire live sessions until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        self.expire_sessions(Utc::now()).await;
                    }
                }
            }
            debug!("live session sweeper stopped");
        })
    }
}

fn event_of(msg: &LocationMessage) -> LocationEvent {
    LocationEvent {
        user_id: msg.user_id,
        latitude: msg.latitude,
        longitude: msg.longitude,
        timestamp: msg.received_at,
    }
}

fn outcome_message(outcome: &RelayOutcome) -> String {
    match outcome {
        RelayOutcome::Forwarded { packet } => {
            let source = packet.split('>').next().unwrap_or_default();
            format!(
                "Position sent to APRS-IS\n<code>{}</code>\n\n<a href=\"{}\">See it on aprs.fi</a>",
                escape_html(packet),
                aprs_fi_link(source)
            )
        }
        RelayOutcome::Unconfigured => {
            "Your callsign is not configured yet, use /setcall before sending positions".to_string()
        }
        RelayOutcome::Suppressed { wait } => format!(
            "Minimum interval not elapsed, retry in {}",
            format_duration(wait.as_secs_f64().ceil() as i64)
        ),
        RelayOutcome::Failed { error } => {
            format!("❌ Position was not sent: {}", escape_html(error))
        }
        RelayOutcome::NotApproved | RelayOutcome::UnknownUser => UNAUTHORIZED_MESSAGE.to_string(),
    }
}
