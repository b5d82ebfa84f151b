use std::fmt::Write as _;

use tokio::sync::mpsc;
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    fmt, layer::Context, prelude::*, registry::LookupSpan, EnvFilter, Layer,
};

use crate::{errors::Error, Result};

/// Capacity of the admin alert queue; alerts beyond it are dropped.
const ALERT_QUEUE: usize = 64;

/// A WARN/ERROR event destined for the admin chat.
#[derive(Clone, Debug)]
pub struct AdminAlert {
    pub level: Level,
    pub target: String,
    pub message: String,
}

pub type AlertReceiver = mpsc::Receiver<AdminAlert>;

/// Initialize tracing for the gateway.
///
/// Returns the receiving end of the admin alert queue; the Telegram adapter
/// drains it into the admin chat.
pub fn init(service_name: &str) -> Result<AlertReceiver> {
    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,aprsgate=info,aprsgate_core=info,aprsgate_aprsis=info,aprsgate_telegram=info,{service_name}=info"
        ))
    });

    let (tx, rx) = mpsc::channel(ALERT_QUEUE);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_ansi(true))
        .with(AlertLayer::new(tx))
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;

    Ok(rx)
}

/// Subscriber layer forwarding WARN/ERROR events from our own crates.
pub struct AlertLayer {
    tx: mpsc::Sender<AdminAlert>,
}

impl AlertLayer {
    pub fn new(tx: mpsc::Sender<AdminAlert>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN || !meta.target().starts_with("aprsgate") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        // Never block the logging call site.
        let _ = self.tx.try_send(AdminAlert {
            level: *meta.level(),
            target: meta.target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}
