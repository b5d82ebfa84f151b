use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{ChatId, UserId};

/// Who sent an inbound update.
#[derive(Clone, Debug)]
pub struct Sender {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
}

/// A `/command args` message.
#[derive(Clone, Debug)]
pub struct Command {
    pub chat_id: ChatId,
    pub sender: Sender,
    pub name: String,
    pub args: String,
}

impl Command {
    /// Build from raw message text (`/cmd@botname arg1 ...`).
    pub fn parse(chat_id: ChatId, sender: Sender, text: &str) -> Self {
        let mut parts = text.trim().splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("").trim();
        let args = parts.next().unwrap_or("").trim().to_string();

        let name = first
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();

        Self {
            chat_id,
            sender,
            name,
            args,
        }
    }
}

/// A location share (one-shot, live start, or live update).
#[derive(Clone, Debug)]
pub struct LocationMessage {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    /// Set for live locations.
    pub live_period: Option<Duration>,
    /// Original send time of the message (start of a live share).
    pub sent_at: DateTime<Utc>,
    /// Time of this particular update (edit time for live updates).
    pub received_at: DateTime<Utc>,
    /// `true` when this is an edit of an earlier location message.
    pub is_update: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Sender {
        Sender {
            user_id: UserId(1),
            username: None,
            first_name: "A".to_string(),
            last_name: None,
        }
    }

    #[test]
    fn parses_command_with_bot_suffix_and_args() {
        let cmd = Command::parse(ChatId(1), sender(), "/SetCall@aprs_bot  iu2frl ");
        assert_eq!(cmd.name, "setcall");
        assert_eq!(cmd.args, "iu2frl");
    }

    #[test]
    fn keeps_multi_word_args_intact() {
        let cmd = Command::parse(ChatId(1), sender(), "/setmsg Hello from the car");
        assert_eq!(cmd.name, "setmsg");
        assert_eq!(cmd.args, "Hello from the car");

        let bare = Command::parse(ChatId(1), sender(), "/printcfg");
        assert_eq!(bare.name, "printcfg");
        assert!(bare.args.is_empty());
    }
}
