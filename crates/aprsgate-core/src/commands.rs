//! Chat command handling: registration, per-user APRS settings, admin approval.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    aprs::{self, source_address},
    config::Config,
    domain::{ChatId, UserId},
    errors::Error,
    formatting::{escape_html, format_datetime},
    messaging::{port::MessagingPort, types::Command},
    security::is_admin,
    store::{UserConfig, UserStore},
    Result,
};

pub const UNAUTHORIZED_MESSAGE: &str = "You are not registered or approved yet, please send the /start command to begin and/or to check the registration status";

/// A validated change to one user setting.
#[derive(Clone, Debug, PartialEq)]
enum Setting {
    Callsign(String),
    Ssid(u8),
    Icon(String),
    Interval(u64),
    Comment(String),
}

impl Setting {
    fn parse(command: &str, args: &str) -> Result<Self> {
        match command {
            "setcall" => Ok(Setting::Callsign(aprs::validate_callsign(single_arg(
                args,
                "/setcall AA0BBB",
            )?)?)),
            "setssid" => Ok(Setting::Ssid(aprs::parse_ssid(single_arg(
                args,
                "/setssid 9",
            )?)?)),
            "seticon" => Ok(Setting::Icon(aprs::parse_icon(single_arg(
                args,
                "/seticon /$",
            )?)?)),
            "setinterval" => Ok(Setting::Interval(aprs::parse_interval(single_arg(
                args,
                "/setinterval 120",
            )?)?)),
            "setmsg" => {
                if args.trim().is_empty() {
                    return Err(Error::Validation(
                        "missing message, syntax is: /setmsg Hello World!".to_string(),
                    ));
                }
                Ok(Setting::Comment(aprs::validate_comment(args)?))
            }
            other => Err(Error::Validation(format!("unknown setting /{other}"))),
        }
    }

    fn apply(&self, user: &mut UserConfig) {
        match self {
            Setting::Callsign(c) => user.callsign = c.clone(),
            Setting::Ssid(s) => user.ssid = *s,
            Setting::Icon(i) => user.icon = i.clone(),
            Setting::Interval(i) => user.min_interval_seconds = *i,
            Setting::Comment(c) => user.comment = c.clone(),
        }
    }

    fn confirmation(&self) -> String {
        match self {
            Setting::Callsign(c) => format!("Callsign was updated to <code>{}</code>", escape_html(c)),
            Setting::Ssid(s) => format!("SSID was updated to <code>{s}</code>"),
            Setting::Icon(i) => format!("Icon was updated to <code>{}</code>", escape_html(i)),
            Setting::Interval(i) => {
                format!("Update interval was updated to <code>{i}</code> seconds")
            }
            Setting::Comment(c) => format!("Message was updated to <code>{}</code>", escape_html(c)),
        }
    }
}

fn single_arg<'a>(args: &'a str, example: &str) -> Result<&'a str> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(Error::Validation(format!(
            "expected exactly one argument, syntax is: {example}"
        ))),
    }
}

pub struct CommandHandler {
    cfg: Arc<Config>,
    store: Arc<UserStore>,
    messenger: Arc<dyn MessagingPort>,
}

impl CommandHandler {
    pub fn new(cfg: Arc<Config>, store: Arc<UserStore>, messenger: Arc<dyn MessagingPort>) -> Self {
        Self {
            cfg,
            store,
            messenger,
        }
    }

    pub async fn handle(&self, cmd: Command) -> Result<()> {
        match cmd.name.as_str() {
            "start" => self.cmd_start(&cmd).await,
            "help" => self.reply(&cmd, HELP_TEXT).await,
            "setcall" | "setssid" | "seticon" | "setinterval" | "setmsg" => {
                self.cmd_setting(&cmd).await
            }
            "printcfg" => self.cmd_printcfg(&cmd).await,
            "approve" => self.cmd_approve(&cmd).await,
            "listusers" => self.cmd_listusers(&cmd).await,
            _ => {
                let msg = format!(
                    "Unknown command: /{}\nSend /help for instructions",
                    escape_html(&cmd.name)
                );
                self.reply(&cmd, &msg).await
            }
        }
    }

    async fn reply(&self, cmd: &Command, html: &str) -> Result<()> {
        self.messenger.send_html(cmd.chat_id, html).await?;
        Ok(())
    }

    /// Best-effort notification; failures are logged, never surfaced to the caller.
    async fn notify(&self, chat_id: ChatId, html: &str) {
        if let Err(e) = self.messenger.send_html(chat_id, html).await {
            warn!(chat_id = chat_id.0, error = %e, "notification failed");
        }
    }

    async fn cmd_start(&self, cmd: &Command) -> Result<()> {
        let sender = &cmd.sender;
        let (user, created) = self
            .store
            .register(sender.user_id, sender.username.clone(), Utc::now())
            .await?;

        let first_name = escape_html(&sender.first_name);
        let registered = format_datetime(&user.registered_at);

        if !created {
            let status = if user.approved {
                "approved"
            } else {
                "pending approval"
            };
            let body = format!(
                "Welcome back {first_name}\n\n\
Registration date: <code>{registered} UTC</code>\n\
Account status: <code>{status}</code>"
            );
            return self.reply(cmd, &body).await;
        }

        let body = format!(
            "Welcome {first_name}\n\
You just accessed the APRS bot\n\n\
Registration date: <code>{registered} UTC</code>\n\
Account status: <code>pending approval</code>"
        );
        self.reply(cmd, &body).await?;

        let Some(admin) = self.cfg.admin_id else {
            warn!(
                user_id = sender.user_id.0,
                "new user registered but no admin is configured to approve it"
            );
            return Ok(());
        };
        let notice = format!(
            "New user registered: @{}\n\n\
Name: {}\n\
Surname: {}\n\
Approve it with: <code>/approve {}</code>",
            escape_html(sender.username.as_deref().unwrap_or("-")),
            first_name,
            escape_html(sender.last_name.as_deref().unwrap_or("-")),
            sender.user_id.0
        );
        self.notify(ChatId(admin), &notice).await;
        Ok(())
    }

    async fn cmd_setting(&self, cmd: &Command) -> Result<()> {
        let user_id = cmd.sender.user_id;
        if !self.store.is_approved(user_id).await {
            return self.reply(cmd, UNAUTHORIZED_MESSAGE).await;
        }

        let setting = match Setting::parse(&cmd.name, &cmd.args) {
            Ok(s) => s,
            Err(Error::Validation(reason)) => {
                warn!(user_id = user_id.0, command = %cmd.name, %reason, "rejected setting");
                return self
                    .reply(cmd, &format!("❌ {}", escape_html(&reason)))
                    .await;
            }
            Err(e) => return Err(e),
        };

        let updated = self.store.update(user_id, |u| setting.apply(u)).await?;
        if updated.is_none() {
            return self.reply(cmd, UNAUTHORIZED_MESSAGE).await;
        }
        info!(user_id = user_id.0, ?setting, "user setting updated");
        self.reply(cmd, &setting.confirmation()).await
    }

    async fn cmd_printcfg(&self, cmd: &Command) -> Result<()> {
        let user_id = cmd.sender.user_id;
        let Some(user) = self.store.get(user_id).await.filter(|u| u.approved) else {
            return self.reply(cmd, UNAUTHORIZED_MESSAGE).await;
        };

        let configured = !user.callsign.eq_ignore_ascii_case(&self.cfg.default_callsign);
        let status = if configured {
            "ready to send positions"
        } else {
            "callsign not set, use /setcall"
        };
        let body = format!(
            "Current configuration:\n\n\
User ID: <code>{}</code>\n\
Callsign: <code>{}</code>\n\
SSID: <code>{}</code>\n\
APRS callsign: <code>{}</code>\n\
Comment: <code>{}</code>\n\
Icon: <code>{}</code>\n\
Beacon interval: <code>{}s</code>\n\
Status: {status}",
            user.user_id,
            escape_html(&user.callsign),
            user.ssid,
            escape_html(&source_address(&user.callsign, user.ssid)),
            escape_html(&user.comment),
            escape_html(&user.icon),
            user.min_interval_seconds,
        );
        self.reply(cmd, &body).await
    }

    fn is_admin(&self, cmd: &Command) -> bool {
        let ok = is_admin(Some(cmd.sender.user_id), self.cfg.admin_id);
        if !ok {
            warn!(
                user_id = cmd.sender.user_id.0,
                command = %cmd.name,
                "admin command from non-admin user ignored"
            );
        }
        ok
    }

    async fn cmd_approve(&self, cmd: &Command) -> Result<()> {
        if !self.is_admin(cmd) {
            return Ok(());
        }

        let target = single_arg(&cmd.args, "/approve 123456")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        let Some(target) = target else {
            return self
                .reply(cmd, "Missing or invalid target user to be approved")
                .await;
        };

        match self.store.toggle_approval(UserId(target)).await? {
            None => {
                self.reply(cmd, &format!("User <code>{target}</code> is not registered"))
                    .await
            }
            Some(true) => {
                info!(target, "user approved");
                self.reply(cmd, &format!("User <code>{target}</code> was approved"))
                    .await?;
                self.notify(
                    ChatId(target),
                    "Hurray! Your account was activated! Send /help to configure it.",
                )
                .await;
                Ok(())
            }
            Some(false) => {
                info!(target, "user disapproved");
                self.reply(cmd, &format!("User <code>{target}</code> was disapproved"))
                    .await
            }
        }
    }

    async fn cmd_listusers(&self, cmd: &Command) -> Result<()> {
        if !self.is_admin(cmd) {
            return Ok(());
        }

        let progress = self
            .messenger
            .send_html(cmd.chat_id, "Fetching users list, please wait")
            .await?;
        let users = self.store.list().await;

        if users.is_empty() {
            return self.messenger.edit_html(progress, "No users were found").await;
        }
        self.messenger
            .edit_html(progress, &format!("Found {} users", users.len()))
            .await?;

        for user in users {
            let body = format!(
                "User id: <code>{}</code>\n\
Callsign: <code>{}</code>\n\
Comment: <code>{}</code>\n\
Username: {}\n\
Approved: {}\n\
Registration date: <code>{} UTC</code>",
                user.user_id,
                escape_html(&source_address(&user.callsign, user.ssid)),
                escape_html(&user.comment),
                escape_html(user.username.as_deref().unwrap_or("-")),
                if user.approved { "yes" } else { "no" },
                format_datetime(&user.registered_at),
            );
            self.reply(cmd, &body).await?;
        }
        Ok(())
    }
}

const HELP_TEXT: &str = "Here are the instructions for the APRS bot, there are few simple steps to configure it\n\n\
First you need to start the communication with the bot using the command /start, this will add you to the database.\n\
The same /start command can also be used to check if your account was enabled by an administrator, this is a manual process and may take some time.\n\n\
Once your account is enabled, you can configure the APRS parameters as follows:\n\
<code>/setcall AA0BBB</code> to set your callsign to AA0BBB\n\
<code>/setssid 9</code> to set your APRS SSID to 9 (default value for mobile stations)\n\
<code>/seticon /$</code> to set your APRS icon to a phone icon\n\
<code>/setinterval 120</code> to set the minimum beaconing interval to 120s\n\
<code>/setmsg Hello</code> to set the APRS message to be sent\n\n\
/printcfg can be used to validate the APRS parameters, make sure to use it before sending any position\n\n\
Once everything is set up, just send your position and it will be sent to the APRS-IS server. You can also share a live position to enable automatic beaconing.";

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::test_config,
        domain::{MessageId, MessageRef},
        messaging::types::Sender,
        store::test_defaults,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeMessenger {
        next_id: Mutex<i32>,
        sends: Mutex<Vec<(ChatId, String)>>,
        edits: Mutex<Vec<(MessageRef, String)>>,
    }

    impl FakeMessenger {
        pub(crate) fn sent(&self) -> Vec<(ChatId, String)> {
            self.sends.lock().unwrap().clone()
        }

        pub(crate) fn sent_to(&self, chat_id: i64) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter(|(c, _)| c.0 == chat_id)
                .map(|(_, html)| html)
                .collect()
        }

        fn edited(&self) -> Vec<String> {
            self.edits
                .lock()
                .unwrap()
                .iter()
                .map(|(_, html)| html.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            self.sends.lock().unwrap().push((chat_id, html.to_string()));
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(*id),
            })
        }

        async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
            self.edits.lock().unwrap().push((msg, html.to_string()));
            Ok(())
        }
    }

    const ADMIN: i64 = 1;

    fn cmd(user: i64, text: &str) -> Command {
        Command::parse(
            ChatId(user),
            Sender {
                user_id: UserId(user),
                username: Some(format!("user{user}")),
                first_name: "Ham".to_string(),
                last_name: None,
            },
            text,
        )
    }

    fn setup() -> (Arc<UserStore>, Arc<FakeMessenger>, CommandHandler) {
        let store = Arc::new(UserStore::in_memory(test_defaults()));
        let messenger = Arc::new(FakeMessenger::default());
        let handler = CommandHandler::new(test_config(), store.clone(), messenger.clone());
        (store, messenger, handler)
    }

    async fn approved_user(store: &UserStore, user: i64) {
        store.register(UserId(user), None, Utc::now()).await.unwrap();
        store
            .update(UserId(user), |u| u.approved = true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_registers_and_notifies_admin() {
        let (store, messenger, handler) = setup();

        handler.handle(cmd(42, "/start")).await.unwrap();

        let user = store.get(UserId(42)).await.unwrap();
        assert!(!user.approved);
        assert_eq!(user.username.as_deref(), Some("user42"));

        let to_user = messenger.sent_to(42);
        assert_eq!(to_user.len(), 1);
        assert!(to_user[0].contains("pending approval"));

        let to_admin = messenger.sent_to(ADMIN);
        assert_eq!(to_admin.len(), 1);
        assert!(to_admin[0].contains("/approve 42"));
    }

    #[tokio::test]
    async fn second_start_reports_status_without_notifying_admin() {
        let (store, messenger, handler) = setup();
        handler.handle(cmd(42, "/start")).await.unwrap();
        store.toggle_approval(UserId(42)).await.unwrap();

        handler.handle(cmd(42, "/start")).await.unwrap();

        let to_user = messenger.sent_to(42);
        assert!(to_user[1].starts_with("Welcome back"));
        assert!(to_user[1].contains("<code>approved</code>"));
        assert_eq!(messenger.sent_to(ADMIN).len(), 1);
    }

    #[tokio::test]
    async fn settings_require_approval() {
        let (store, messenger, handler) = setup();
        handler.handle(cmd(42, "/start")).await.unwrap();

        handler.handle(cmd(42, "/setcall IU2FRL")).await.unwrap();

        assert_eq!(messenger.sent_to(42).last().unwrap(), UNAUTHORIZED_MESSAGE);
        assert_eq!(store.get(UserId(42)).await.unwrap().callsign, "N0CALL");
    }

    #[tokio::test]
    async fn approved_user_updates_every_setting() {
        let (store, messenger, handler) = setup();
        approved_user(&store, 42).await;

        for text in [
            "/setcall ea8/iu2frl/p",
            "/setssid 7",
            "/seticon /k",
            "/setinterval 120",
            "/setmsg On the road again",
        ] {
            handler.handle(cmd(42, text)).await.unwrap();
        }

        let user = store.get(UserId(42)).await.unwrap();
        assert_eq!(user.callsign, "IU2FRL");
        assert_eq!(user.ssid, 7);
        assert_eq!(user.icon, "/k");
        assert_eq!(user.min_interval_seconds, 120);
        assert_eq!(user.comment, "On the road again");

        let replies = messenger.sent_to(42);
        assert_eq!(replies[0], "Callsign was updated to <code>IU2FRL</code>");
        assert!(replies.iter().all(|r| !r.starts_with('❌')));
    }

    #[tokio::test]
    async fn invalid_settings_are_reported_and_not_applied() {
        let (store, messenger, handler) = setup();
        approved_user(&store, 42).await;

        for text in [
            "/setcall HELLO",
            "/setcall",
            "/setssid 16",
            "/seticon abc",
            "/setinterval -1",
            "/setinterval 10 20",
            "/setmsg",
        ] {
            handler.handle(cmd(42, text)).await.unwrap();
        }

        let replies = messenger.sent_to(42);
        assert_eq!(replies.len(), 7);
        assert!(replies.iter().all(|r| r.starts_with('❌')));
        let user = store.get(UserId(42)).await.unwrap();
        assert_eq!(user.callsign, "N0CALL");
        assert_eq!(user.ssid, 9);
        assert_eq!(user.icon, "/$");
        assert_eq!(user.min_interval_seconds, 30);
        assert_eq!(user.comment, "Telegram APRS bot");
    }

    #[tokio::test]
    async fn printcfg_shows_source_address() {
        let (store, messenger, handler) = setup();
        approved_user(&store, 42).await;
        handler.handle(cmd(42, "/setcall IU2FRL")).await.unwrap();

        handler.handle(cmd(42, "/printcfg")).await.unwrap();

        let last = messenger.sent_to(42).pop().unwrap();
        assert!(last.contains("APRS callsign: <code>IU2FRL-9</code>"));
        assert!(last.contains("ready to send positions"));
    }

    #[tokio::test]
    async fn approve_is_admin_only_and_toggles() {
        let (store, messenger, handler) = setup();
        handler.handle(cmd(42, "/start")).await.unwrap();

        // Non-admin: silently ignored.
        handler.handle(cmd(42, "/approve 42")).await.unwrap();
        assert!(!store.is_approved(UserId(42)).await);

        handler.handle(cmd(ADMIN, "/approve 42")).await.unwrap();
        assert!(store.is_approved(UserId(42)).await);
        assert!(messenger
            .sent_to(42)
            .last()
            .unwrap()
            .starts_with("Hurray!"));

        handler.handle(cmd(ADMIN, "/approve 42")).await.unwrap();
        assert!(!store.is_approved(UserId(42)).await);
        assert!(messenger
            .sent_to(ADMIN)
            .last()
            .unwrap()
            .contains("was disapproved"));

        handler.handle(cmd(ADMIN, "/approve 999")).await.unwrap();
        assert!(messenger
            .sent_to(ADMIN)
            .last()
            .unwrap()
            .contains("is not registered"));

        handler.handle(cmd(ADMIN, "/approve bob")).await.unwrap();
        assert!(messenger
            .sent_to(ADMIN)
            .last()
            .unwrap()
            .starts_with("Missing or invalid"));
    }

    #[tokio::test]
    async fn listusers_reports_every_user() {
        let (store, messenger, handler) = setup();
        handler.handle(cmd(ADMIN, "/listusers")).await.unwrap();
        assert_eq!(messenger.edited(), vec!["No users were found".to_string()]);

        approved_user(&store, 10).await;
        approved_user(&store, 11).await;
        handler.handle(cmd(ADMIN, "/listusers")).await.unwrap();

        assert_eq!(messenger.edited().last().unwrap(), "Found 2 users");
        let details: Vec<_> = messenger
            .sent_to(ADMIN)
            .into_iter()
            .filter(|m| m.starts_with("User id:"))
            .collect();
        assert_eq!(details.len(), 2);
        assert!(details[0].contains("<code>10</code>"));
    }

    #[tokio::test]
    async fn unknown_command_gets_a_hint() {
        let (_store, messenger, handler) = setup();
        handler.handle(cmd(42, "/frobnicate")).await.unwrap();
        assert!(messenger.sent_to(42)[0].starts_with("Unknown command: /frobnicate"));
    }
}
