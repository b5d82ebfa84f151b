use std::sync::Arc;

use tracing::{info, warn};

use aprsgate_aprsis::{AprsIsClient, AprsIsConfig};

use aprsgate_core::{
    config::Config,
    ports::AprsUplink,
    store::{UserDefaults, UserStore},
};

#[tokio::main]
async fn main() -> Result<(), aprsgate_core::Error> {
    let alerts = aprsgate_core::logging::init("aprsgate")?;

    let cfg = Arc::new(Config::load()?);
    info!(
        server = %cfg.aprs_server,
        port = cfg.aprs_port,
        login = %cfg.login_callsign(),
        store = %cfg.user_store_file.display(),
        "configuration loaded"
    );

    let store = Arc::new(
        UserStore::open(cfg.user_store_file.clone(), UserDefaults::from_config(&cfg)).await?,
    );

    let uplink: Arc<dyn AprsUplink> = Arc::new(AprsIsClient::new(AprsIsConfig::from_config(&cfg)));
    // The first send reconnects if this fails.
    if let Err(e) = uplink.connect().await {
        warn!(error = %e, "initial APRS-IS connection failed");
    }

    aprsgate_telegram::router::run_polling(cfg, store, uplink, alerts)
        .await
        .map_err(|e| aprsgate_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
