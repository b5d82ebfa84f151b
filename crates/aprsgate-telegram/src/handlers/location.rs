use std::{sync::Arc, time::Duration};

use teloxide::prelude::*;
use tracing::error;

use aprsgate_core::{
    domain::{ChatId, UserId},
    messaging::types::LocationMessage,
};

use crate::router::AppState;

pub async fn handle_location(
    msg: Message,
    state: Arc<AppState>,
    is_update: bool,
) -> ResponseResult<()> {
    let (Some(loc), Some(user)) = (msg.location(), msg.from()) else {
        return Ok(());
    };

    let location = LocationMessage {
        chat_id: ChatId(msg.chat.id.0),
        user_id: UserId(user.id.0 as i64),
        latitude: loc.latitude,
        longitude: loc.longitude,
        live_period: loc.live_period.map(|secs| Duration::from_secs(u64::from(secs))),
        sent_at: msg.date,
        received_at: msg.edit_date().copied().unwrap_or(msg.date),
        is_update,
    };
    let user_id = location.user_id.0;

    if let Err(e) = state.locations.handle_location(location).await {
        error!(user_id, error = %e, "location handling failed");
    }
    Ok(())
}
