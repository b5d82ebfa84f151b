use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    Result,
};

/// Outbound chat port used by the command handler and live tracking.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;
}
