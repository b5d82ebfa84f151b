use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{aprs, errors::Error, Result};

/// Typed configuration for the gateway.
///
/// Everything comes from the environment (optionally seeded from `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    /// The single identity allowed to run admin commands and receive alerts.
    pub admin_id: Option<i64>,

    // APRS-IS
    pub aprs_server: String,
    pub aprs_port: u16,
    /// Login callsign. `None` means read-only login as `default_callsign`.
    pub aprs_user: Option<String>,
    /// Sentinel callsign marking an unconfigured user (and the read-only login).
    pub default_callsign: String,
    pub aprs_connect_timeout: Duration,
    pub aprs_io_timeout: Duration,
    pub aprs_reconnect_attempts: u32,
    pub aprs_reconnect_backoff: Duration,

    // User store
    pub user_store_file: PathBuf,

    // Defaults for freshly registered users
    pub default_ssid: u8,
    pub default_comment: String,
    pub default_icon: String,
    pub default_interval_secs: u64,

    // Live tracking
    pub live_sweep_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the process env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Required
        let telegram_bot_token = get("BOT_TOKEN").ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;

        let admin_id = match get("BOT_ADMIN") {
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
                Error::Config(format!("BOT_ADMIN must be a numeric user id, got {raw:?}"))
            })?),
            None => None,
        };

        // APRS-IS
        let aprs_server = get("APRS_SERVER").unwrap_or_else(|| "rotate.aprs2.net".to_string());
        let aprs_port = parse_or("APRS_PORT", get("APRS_PORT"), 14580u16)?;
        let aprs_user = get("APRS_USER").map(|s| s.trim().to_uppercase());
        let default_callsign = get("DEFAULT_CALLSIGN")
            .map(|s| s.trim().to_uppercase())
            .unwrap_or_else(|| "N0CALL".to_string());

        let aprs_connect_timeout = Duration::from_millis(parse_or(
            "APRS_CONNECT_TIMEOUT_MS",
            get("APRS_CONNECT_TIMEOUT_MS"),
            10_000u64,
        )?);
        let aprs_io_timeout = Duration::from_millis(parse_or(
            "APRS_IO_TIMEOUT_MS",
            get("APRS_IO_TIMEOUT_MS"),
            5_000u64,
        )?);
        let aprs_reconnect_attempts = parse_or(
            "APRS_RECONNECT_ATTEMPTS",
            get("APRS_RECONNECT_ATTEMPTS"),
            1u32,
        )?
        .min(5);
        let aprs_reconnect_backoff = Duration::from_millis(parse_or(
            "APRS_RECONNECT_BACKOFF_MS",
            get("APRS_RECONNECT_BACKOFF_MS"),
            1_000u64,
        )?);

        let user_store_file = get("USER_STORE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("db/users.json"));

        // Registration defaults
        let default_ssid = parse_or("DEFAULT_SSID", get("DEFAULT_SSID"), 9u8)?;
        if default_ssid > 15 {
            return Err(Error::Config(format!(
                "DEFAULT_SSID must be between 0 and 15, got {default_ssid}"
            )));
        }
        let default_comment = aprs::validate_comment(
            &get("DEFAULT_COMMENT").unwrap_or_else(|| "Telegram APRS bot".to_string()),
        )
        .map_err(|e| Error::Config(format!("DEFAULT_COMMENT: {e}")))?;
        let default_icon = aprs::parse_icon(&get("DEFAULT_ICON").unwrap_or_else(|| "/$".to_string()))
            .map_err(|e| Error::Config(format!("DEFAULT_ICON: {e}")))?;
        let default_interval_secs =
            parse_or("DEFAULT_INTERVAL", get("DEFAULT_INTERVAL"), 30u64)?;

        let live_sweep_interval = Duration::from_secs(
            parse_or(
                "LIVE_SWEEP_INTERVAL_SECS",
                get("LIVE_SWEEP_INTERVAL_SECS"),
                59u64,
            )?
            .max(1),
        );

        Ok(Self {
            telegram_bot_token,
            admin_id,
            aprs_server,
            aprs_port,
            aprs_user,
            default_callsign,
            aprs_connect_timeout,
            aprs_io_timeout,
            aprs_reconnect_attempts,
            aprs_reconnect_backoff,
            user_store_file,
            default_ssid,
            default_comment,
            default_icon,
            default_interval_secs,
            live_sweep_interval,
        })
    }

    /// Callsign used for the APRS-IS login line.
    pub fn login_callsign(&self) -> &str {
        self.aprs_user.as_deref().unwrap_or(&self.default_callsign)
    }

    /// Whether the login is read-only (no user configured, passcode `-1`).
    pub fn is_read_only(&self) -> bool {
        self.aprs_user.is_none()
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {s:?}"))),
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> std::sync::Arc<Config> {
    std::sync::Arc::new(Config {
        telegram_bot_token: "x".to_string(),
        admin_id: Some(1),
        aprs_server: "127.0.0.1".to_string(),
        aprs_port: 14580,
        aprs_user: Some("IU2FRL".to_string()),
        default_callsign: "N0CALL".to_string(),
        aprs_connect_timeout: Duration::from_secs(1),
        aprs_io_timeout: Duration::from_secs(1),
        aprs_reconnect_attempts: 1,
        aprs_reconnect_backoff: Duration::from_millis(0),
        user_store_file: "/tmp/aprsgate-test-users.json".into(),
        default_ssid: 9,
        default_comment: "Telegram APRS bot".to_string(),
        default_icon: "/$".to_string(),
        default_interval_secs: 30,
        live_sweep_interval: Duration::from_secs(59),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_only_token_is_set() {
        let cfg = load(&[("BOT_TOKEN", "abc")]).unwrap();
        assert_eq!(cfg.aprs_server, "rotate.aprs2.net");
        assert_eq!(cfg.aprs_port, 14580);
        assert_eq!(cfg.default_callsign, "N0CALL");
        assert_eq!(cfg.default_ssid, 9);
        assert_eq!(cfg.default_icon, "/$");
        assert_eq!(cfg.default_interval_secs, 30);
        assert_eq!(cfg.aprs_reconnect_attempts, 1);
        assert!(cfg.admin_id.is_none());
        assert!(cfg.is_read_only());
        assert_eq!(cfg.login_callsign(), "N0CALL");
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let err = load(&[("APRS_PORT", "14580")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        assert!(load(&[("BOT_TOKEN", "abc"), ("APRS_PORT", "port")]).is_err());
        assert!(load(&[("BOT_TOKEN", "abc"), ("BOT_ADMIN", "admin")]).is_err());
        assert!(load(&[("BOT_TOKEN", "abc"), ("DEFAULT_SSID", "16")]).is_err());
    }

    #[test]
    fn registration_defaults_must_be_valid_aprs() {
        for icon in ["X", "abc", "a$"] {
            let err = load(&[("BOT_TOKEN", "abc"), ("DEFAULT_ICON", icon)]).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "icon {icon:?} accepted");
        }
        let long = "x".repeat(aprs::MAX_COMMENT_LEN + 1);
        let err = load(&[("BOT_TOKEN", "abc"), ("DEFAULT_COMMENT", long.as_str())]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let cfg = load(&[
            ("BOT_TOKEN", "abc"),
            ("DEFAULT_ICON", "/>"),
            ("DEFAULT_COMMENT", " mobile "),
        ])
        .unwrap();
        assert_eq!(cfg.default_icon, "/>");
        assert_eq!(cfg.default_comment, "mobile");
    }

    #[test]
    fn aprs_user_is_uppercased_and_used_for_login() {
        let cfg = load(&[
            ("BOT_TOKEN", "abc"),
            ("APRS_USER", "iu2frl"),
            ("BOT_ADMIN", "42"),
        ])
        .unwrap();
        assert_eq!(cfg.login_callsign(), "IU2FRL");
        assert!(!cfg.is_read_only());
        assert_eq!(cfg.admin_id, Some(42));
    }
}
