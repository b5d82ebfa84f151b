//! Persisted user table.
//!
//! One JSON document holding every registered user. The whole table is small
//! (one row per chat user), so every mutation rewrites the file atomically
//! (temp file + rename).

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::Config, domain::UserId, errors::Error, Result};

const STORE_VERSION: u32 = 1;

/// Per-user APRS configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub approved: bool,
    pub callsign: String,
    pub ssid: u8,
    pub comment: String,
    pub icon: String,
    pub min_interval_seconds: u64,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Values given to a freshly registered user.
#[derive(Clone, Debug)]
pub struct UserDefaults {
    pub callsign: String,
    pub ssid: u8,
    pub comment: String,
    pub icon: String,
    pub min_interval_seconds: u64,
}

impl UserDefaults {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            callsign: cfg.default_callsign.clone(),
            ssid: cfg.default_ssid,
            comment: cfg.default_comment.clone(),
            icon: cfg.default_icon.clone(),
            min_interval_seconds: cfg.default_interval_secs,
        }
    }

    fn new_user(&self, user_id: UserId, username: Option<String>, now: DateTime<Utc>) -> UserConfig {
        UserConfig {
            user_id: user_id.0,
            username,
            registered_at: now,
            approved: false,
            callsign: self.callsign.clone(),
            ssid: self.ssid,
            comment: self.comment.clone(),
            icon: self.icon.clone(),
            min_interval_seconds: self.min_interval_seconds,
            last_sent_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    users: Vec<UserConfig>,
}

pub struct UserStore {
    path: Option<PathBuf>,
    defaults: UserDefaults,
    users: Mutex<BTreeMap<i64, UserConfig>>,
}

impl UserStore {
    /// Open (or create on first write) the JSON store at `path`.
    pub async fn open(path: PathBuf, defaults: UserDefaults) -> Result<Self> {
        let users = match tokio::fs::read_to_string(&path).await {
            Ok(txt) if txt.trim().is_empty() => BTreeMap::new(),
            Ok(txt) => {
                let file: StoreFile = serde_json::from_str(&txt).map_err(|e| Error::Store {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                file.users.into_iter().map(|u| (u.user_id, u)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };

        info!(path = %path.display(), users = users.len(), "user store loaded");

        Ok(Self {
            path: Some(path),
            defaults,
            users: Mutex::new(users),
        })
    }

    /// Store without a backing file (tests, dry runs).
    pub fn in_memory(defaults: UserDefaults) -> Self {
        Self {
            path: None,
            defaults,
            users: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a user on first contact. Returns the row and whether it was created.
    pub async fn register(
        &self,
        user_id: UserId,
        username: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(UserConfig, bool)> {
        let mut users = self.users.lock().await;
        if let Some(existing) = users.get(&user_id.0) {
            return Ok((existing.clone(), false));
        }

        let user = self.defaults.new_user(user_id, username, now);
        self.commit(&mut users, user.clone()).await?;
        info!(user_id = user_id.0, "registered new user");
        Ok((user, true))
    }

    pub async fn get(&self, user_id: UserId) -> Option<UserConfig> {
        self.users.lock().await.get(&user_id.0).cloned()
    }

    pub async fn is_approved(&self, user_id: UserId) -> bool {
        self.users
            .lock()
            .await
            .get(&user_id.0)
            .map(|u| u.approved)
            .unwrap_or(false)
    }

    /// Apply `f` to the user's row and persist. `None` if the user is unknown.
    pub async fn update(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut UserConfig) + Send,
    ) -> Result<Option<UserConfig>> {
        let mut users = self.users.lock().await;
        let Some(mut updated) = users.get(&user_id.0).cloned() else {
            return Ok(None);
        };
        f(&mut updated);
        self.commit(&mut users, updated.clone()).await?;
        Ok(Some(updated))
    }

    /// Flip the approval flag. Returns the new state, `None` if the user is unknown.
    pub async fn toggle_approval(&self, user_id: UserId) -> Result<Option<bool>> {
        let updated = self
            .update(user_id, |u| u.approved = !u.approved)
            .await?;
        Ok(updated.map(|u| u.approved))
    }

    pub async fn record_sent(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        self.update(user_id, |u| u.last_sent_at = Some(at)).await?;
        Ok(())
    }

    /// All users ordered by id.
    pub async fn list(&self) -> Vec<UserConfig> {
        self.users.lock().await.values().cloned().collect()
    }

    /// Store `user` and persist; on a failed write the table is left as it was.
    async fn commit(&self, users: &mut BTreeMap<i64, UserConfig>, user: UserConfig) -> Result<()> {
        let user_id = user.user_id;
        let previous = users.insert(user_id, user);
        if let Err(e) = self.persist(users).await {
            match previous {
                Some(prev) => users.insert(user_id, prev),
                None => users.remove(&user_id),
            };
            warn!(user_id, error = %e, "user store write failed, change discarded");
            return Err(e);
        }
        Ok(())
    }

    async fn persist(&self, users: &BTreeMap<i64, UserConfig>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = StoreFile {
            version: STORE_VERSION,
            users: users.values().cloned().collect(),
        };
        let txt = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, txt).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), users = users.len(), "user store saved");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_defaults() -> UserDefaults {
    UserDefaults {
        callsign: "N0CALL".to_string(),
        ssid: 9,
        comment: "Telegram APRS bot".to_string(),
        icon: "/$".to_string(),
        min_interval_seconds: 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        let root = PathBuf::from(format!("/tmp/aprsgate-store-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        root.join("db/users.json")
    }

    #[tokio::test]
    async fn register_creates_pending_user_with_defaults_once() {
        let store = UserStore::in_memory(test_defaults());

        let (user, created) = store
            .register(UserId(5), Some("@ham".to_string()), ts(0))
            .await
            .unwrap();
        assert!(created);
        assert!(!user.approved);
        assert_eq!(user.callsign, "N0CALL");
        assert_eq!(user.ssid, 9);
        assert_eq!(user.min_interval_seconds, 30);
        assert_eq!(user.registered_at, ts(0));

        let (again, created) = store.register(UserId(5), None, ts(100)).await.unwrap();
        assert!(!created);
        assert_eq!(again.registered_at, ts(0));
        assert_eq!(again.username.as_deref(), Some("@ham"));
    }

    #[tokio::test]
    async fn update_and_toggle_unknown_user_is_none() {
        let store = UserStore::in_memory(test_defaults());
        assert!(store
            .update(UserId(1), |u| u.ssid = 1)
            .await
            .unwrap()
            .is_none());
        assert!(store.toggle_approval(UserId(1)).await.unwrap().is_none());
        assert!(!store.is_approved(UserId(1)).await);
    }

    #[tokio::test]
    async fn toggle_approval_flips_state() {
        let store = UserStore::in_memory(test_defaults());
        store.register(UserId(1), None, ts(0)).await.unwrap();

        assert_eq!(store.toggle_approval(UserId(1)).await.unwrap(), Some(true));
        assert!(store.is_approved(UserId(1)).await);
        assert_eq!(store.toggle_approval(UserId(1)).await.unwrap(), Some(false));
        assert!(!store.is_approved(UserId(1)).await);
    }

    #[tokio::test]
    async fn persists_and_reloads_from_disk() {
        let path = temp_path("reload");

        {
            let store = UserStore::open(path.clone(), test_defaults()).await.unwrap();
            store.register(UserId(2), None, ts(0)).await.unwrap();
            store.register(UserId(1), None, ts(1)).await.unwrap();
            store
                .update(UserId(2), |u| {
                    u.callsign = "IU2FRL".to_string();
                    u.approved = true;
                })
                .await
                .unwrap();
            store.record_sent(UserId(2), ts(50)).await.unwrap();
        }

        let reopened = UserStore::open(path.clone(), test_defaults()).await.unwrap();
        let users = reopened.list().await;
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, 1);
        assert_eq!(users[1].callsign, "IU2FRL");
        assert!(users[1].approved);
        assert_eq!(users[1].last_sent_at, Some(ts(50)));

        if let Some(root) = path.parent().and_then(|p| p.parent()) {
            let _ = std::fs::remove_dir_all(root);
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_table_unchanged() {
        let path = temp_path("unwritable");
        let db_dir = path.parent().unwrap().to_path_buf();
        let store = UserStore::open(path.clone(), test_defaults()).await.unwrap();
        store.register(UserId(1), None, ts(0)).await.unwrap();

        // A regular file where the store directory should be makes every write fail.
        std::fs::remove_dir_all(&db_dir).unwrap();
        std::fs::write(&db_dir, "not a directory").unwrap();

        assert!(store.register(UserId(2), None, ts(1)).await.is_err());
        assert!(store.get(UserId(2)).await.is_none());
        // A retried /start still sees a brand new user.
        assert!(store.register(UserId(2), None, ts(2)).await.is_err());
        assert!(store.get(UserId(2)).await.is_none());

        assert!(store.toggle_approval(UserId(1)).await.is_err());
        assert!(!store.is_approved(UserId(1)).await);

        assert!(store
            .update(UserId(1), |u| u.callsign = "IU2FRL".to_string())
            .await
            .is_err());
        assert_eq!(store.get(UserId(1)).await.unwrap().callsign, "N0CALL");

        if let Some(root) = db_dir.parent() {
            let _ = std::fs::remove_dir_all(root);
        }
    }

    #[tokio::test]
    async fn corrupt_file_is_a_store_error() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let err = UserStore::open(path.clone(), test_defaults()).await.err().unwrap();
        assert!(matches!(err, Error::Store { .. }));

        if let Some(root) = path.parent().and_then(|p| p.parent()) {
            let _ = std::fs::remove_dir_all(root);
        }
    }
}
