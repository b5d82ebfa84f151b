//! Telegram update handlers.
//!
//! Each handler converts a teloxide `Message` into a core type and hands it to
//! the matching core service. Failures are logged; the dispatcher never sees them.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::debug;

use aprsgate_core::{domain::UserId, messaging::types::Sender};

use crate::router::AppState;

mod commands;
mod location;

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if msg.location().is_some() {
        return location::handle_location(msg, state, false).await;
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(msg, state).await;
        }
    }

    debug!(chat_id = msg.chat.id.0, "ignoring unsupported message");
    Ok(())
}

/// Live location shares arrive as edits of the original location message.
pub async fn handle_edited_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if msg.location().is_some() {
        return location::handle_location(msg, state, true).await;
    }
    Ok(())
}

fn sender_of(msg: &Message) -> Option<Sender> {
    let user = msg.from()?;
    Some(Sender {
        user_id: UserId(user.id.0 as i64),
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
    })
}
