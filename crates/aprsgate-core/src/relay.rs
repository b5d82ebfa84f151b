//! Location relay: approval + interval gate in front of the APRS-IS uplink.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{aprs::PositionReport, domain::UserId, ports::AprsUplink, store::UserStore};

/// A location update tagged with the user that shared it.
#[derive(Clone, Copy, Debug)]
pub struct LocationEvent {
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// What happened to a submitted event.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayOutcome {
    /// Packet handed to the uplink successfully.
    Forwarded { packet: String },
    /// No such user in the store.
    UnknownUser,
    NotApproved,
    /// Callsign still at the default sentinel (read-only mode).
    Unconfigured,
    /// Minimum interval not elapsed yet; `wait` is the remaining time.
    Suppressed { wait: Duration },
    /// Formatting or transmission failed; the event is dropped.
    Failed { error: String },
}

impl RelayOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, RelayOutcome::Forwarded { .. })
    }
}

#[derive(Default)]
struct UserLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(user_id.0)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct LocationRelay {
    store: Arc<UserStore>,
    uplink: Arc<dyn AprsUplink>,
    default_callsign: String,
    user_locks: UserLocks,
}

impl LocationRelay {
    pub fn new(
        store: Arc<UserStore>,
        uplink: Arc<dyn AprsUplink>,
        default_callsign: impl Into<String>,
    ) -> Self {
        Self {
            store,
            uplink,
            default_callsign: default_callsign.into(),
            user_locks: UserLocks::default(),
        }
    }

    /// Forward the event as an APRS position report, or drop it.
    ///
    /// Events of one user are serialized so the interval check and the
    /// `last_sent_at` update cannot race. Different users only contend on the
    /// uplink's own write lock.
    pub async fn submit(&self, event: LocationEvent) -> RelayOutcome {
        let _guard = self.user_locks.lock_user(event.user_id).await;

        let Some(user) = self.store.get(event.user_id).await else {
            debug!(user_id = event.user_id.0, "location from unknown user dropped");
            return RelayOutcome::UnknownUser;
        };
        if !user.approved {
            info!(user_id = user.user_id, "location from unapproved user dropped");
            return RelayOutcome::NotApproved;
        }
        if user.callsign.trim().is_empty()
            || user.callsign.eq_ignore_ascii_case(&self.default_callsign)
        {
            debug!(
                user_id = user.user_id,
                "user has no callsign configured, dropping location"
            );
            return RelayOutcome::Unconfigured;
        }

        if let Some(last) = user.last_sent_at {
            let min = Duration::from_secs(user.min_interval_seconds);
            // Out-of-order events (timestamp before last_sent_at) count as zero elapsed.
            let elapsed = event
                .timestamp
                .signed_duration_since(last)
                .to_std()
                .unwrap_or_default();
            if elapsed < min {
                let wait = min - elapsed;
                debug!(
                    user_id = user.user_id,
                    wait_secs = wait.as_secs(),
                    "minimum interval not elapsed, suppressing location"
                );
                return RelayOutcome::Suppressed { wait };
            }
        }

        let report = PositionReport {
            callsign: &user.callsign,
            ssid: user.ssid,
            icon: &user.icon,
            comment: &user.comment,
            latitude: event.latitude,
            longitude: event.longitude,
        };
        let packet = match report.to_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!(user_id = user.user_id, error = %e, "cannot format position report");
                return RelayOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        if let Err(e) = self.uplink.send(&packet).await {
            warn!(user_id = user.user_id, error = %e, "APRS-IS send failed, location dropped");
            return RelayOutcome::Failed {
                error: e.to_string(),
            };
        }
        info!(user_id = user.user_id, %packet, "position forwarded");

        if let Err(e) = self.store.record_sent(event.user_id, event.timestamp).await {
            // The packet is out; only the persisted timestamp is stale.
            warn!(user_id = user.user_id, error = %e, "failed to persist last_sent_at");
        }

        RelayOutcome::Forwarded { packet }
    }
}
