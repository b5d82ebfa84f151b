use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aprsgate_core::{
    commands::CommandHandler,
    config::Config,
    domain::ChatId,
    formatting::escape_html,
    logging::{AdminAlert, AlertReceiver},
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    ports::AprsUplink,
    relay::LocationRelay,
    store::UserStore,
    tracking::LocationService,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub commands: Arc<CommandHandler>,
    pub locations: Arc<LocationService>,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    store: Arc<UserStore>,
    uplink: Arc<dyn AprsUplink>,
    alerts: AlertReceiver,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "aprsgate started"),
        Err(e) => warn!(error = %e, "getMe failed, continuing"),
    }
    if cfg.admin_id.is_none() {
        warn!("BOT_ADMIN not set, new users cannot be approved");
    }

    // Throttle outbound calls; the adapter still retries once on RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let relay = Arc::new(LocationRelay::new(
        store.clone(),
        uplink.clone(),
        cfg.default_callsign.clone(),
    ));
    let locations = Arc::new(LocationService::new(
        store.clone(),
        relay,
        messenger.clone(),
    ));
    let commands = Arc::new(CommandHandler::new(
        cfg.clone(),
        store,
        messenger.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = locations
        .clone()
        .spawn_sweeper(cfg.live_sweep_interval, shutdown.clone());
    let forwarder = tokio::spawn(forward_alerts(
        alerts,
        cfg.admin_id.map(ChatId),
        messenger.clone(),
        shutdown.clone(),
    ));

    if let Some(admin) = cfg.admin_id {
        if let Err(e) = messenger
            .send_html(ChatId(admin), "APRS bot is up and running")
            .await
        {
            debug!(error = %e, "startup notification failed");
        }
    }

    let state = Arc::new(AppState {
        commands,
        locations,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handlers::handle_message))
        .branch(Update::filter_edited_message().endpoint(handlers::handle_edited_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("dispatcher stopped, shutting down");
    shutdown.cancel();
    let _ = sweeper.await;
    let _ = forwarder.await;
    uplink.close().await?;

    Ok(())
}

/// Drain the admin alert queue into the admin chat until shutdown.
async fn forward_alerts(
    mut alerts: AlertReceiver,
    admin: Option<ChatId>,
    messenger: Arc<dyn MessagingPort>,
    shutdown: CancellationToken,
) {
    loop {
        let alert = tokio::select! {
            _ = shutdown.cancelled() => break,
            alert = alerts.recv() => alert,
        };
        let Some(alert) = alert else {
            break;
        };
        let Some(admin) = admin else {
            continue;
        };
        // Logged below WARN so a failing send does not feed the queue again.
        if let Err(e) = messenger.send_html(admin, &format_alert(&alert)).await {
            debug!(error = %e, "admin alert not delivered");
        }
    }
}

fn format_alert(alert: &AdminAlert) -> String {
    format!(
        "⚠️ <b>{}</b> <code>{}</code>\n{}",
        alert.level,
        escape_html(&alert.target),
        escape_html(&alert.message)
    )
}
