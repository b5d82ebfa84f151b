use std::sync::Arc;

use teloxide::prelude::*;
use tracing::error;

use aprsgate_core::{domain::ChatId, messaging::types::Command};

use crate::router::AppState;

use super::sender_of;

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let (Some(text), Some(sender)) = (msg.text(), sender_of(&msg)) else {
        return Ok(());
    };

    let cmd = Command::parse(ChatId(msg.chat.id.0), sender, text);
    let name = cmd.name.clone();
    let user_id = cmd.sender.user_id.0;

    if let Err(e) = state.commands.handle(cmd).await {
        error!(user_id, command = %name, error = %e, "command failed");
    }
    Ok(())
}
