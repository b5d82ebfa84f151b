//! APRS-IS adapter: one long-lived, logged-in TCP connection to an APRS-IS server.
//!
//! Writes are serialized behind a single mutex so concurrent relays never
//! interleave bytes. A background task drains whatever the server sends and
//! flags the connection dead on EOF; the next `send` reconnects, making at
//! most `reconnect_attempts` connection attempts.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aprsgate_core::{
    aprs::{login_line, passcode},
    config::Config,
    errors::Error,
    ports::AprsUplink,
    Result,
};

pub const SOFTWARE: &str = "aprsgate";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SERVER_TAIL_MAX_LINES: usize = 20;

#[derive(Clone, Debug)]
pub struct AprsIsConfig {
    pub host: String,
    pub port: u16,
    pub login_callsign: String,
    /// `None` logs in read-only (`pass -1`).
    pub passcode: Option<u16>,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Connection attempts one `send` may make; at least one.
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl AprsIsConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let login_callsign = cfg.login_callsign().to_string();
        let passcode = if cfg.is_read_only() {
            warn!(
                callsign = %login_callsign,
                "APRS_USER not set, logging in read-only; servers will not forward positions"
            );
            None
        } else {
            Some(passcode(&login_callsign))
        };

        Self {
            host: cfg.aprs_server.clone(),
            port: cfg.aprs_port,
            login_callsign,
            passcode,
            connect_timeout: cfg.aprs_connect_timeout,
            io_timeout: cfg.aprs_io_timeout,
            reconnect_attempts: cfg.aprs_reconnect_attempts,
            reconnect_backoff: cfg.aprs_reconnect_backoff,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Last lines received from the server, for diagnostics.
#[derive(Debug, Default)]
struct ServerTail {
    lines: VecDeque<String>,
}

impl ServerTail {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > SERVER_TAIL_MAX_LINES {
            self.lines.pop_front();
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

struct Connection {
    writer: OwnedWriteHalf,
    /// Cancelled by the reader task once the server side is gone.
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn write_line(&mut self, payload: &str, io_timeout: Duration) -> Result<()> {
        write_with_timeout(&mut self.writer, payload, io_timeout).await
    }
}

async fn write_with_timeout(
    writer: &mut OwnedWriteHalf,
    payload: &str,
    io_timeout: Duration,
) -> Result<()> {
    let write = async {
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await
    };
    match timeout(io_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Connection(format!("write failed: {e}"))),
        Err(_) => Err(Error::Connection("write timed out".to_string())),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct AprsIsClient {
    cfg: AprsIsConfig,
    conn: Mutex<Option<Connection>>,
    tail: Arc<Mutex<ServerTail>>,
}

impl AprsIsClient {
    pub fn new(cfg: AprsIsConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(None),
            tail: Arc::new(Mutex::new(ServerTail::default())),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .is_some_and(Connection::is_alive)
    }

    async fn open(&self) -> Result<Connection> {
        let addr = self.cfg.addr();
        let stream = match timeout(self.cfg.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(Error::Connection(format!("connect to {addr} failed: {e}"))),
            Err(_) => return Err(Error::Connection(format!("connect to {addr} timed out"))),
        };
        stream.set_nodelay(true)?;

        let (read, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let login = login_line(
            &self.cfg.login_callsign,
            self.cfg.passcode,
            SOFTWARE,
            VERSION,
        );
        write_with_timeout(&mut writer, &format!("{login}\r\n"), self.cfg.io_timeout).await?;

        let resp = match timeout(self.cfg.io_timeout, self.await_logresp(&mut lines)).await {
            Ok(Ok(Some(resp))) => resp,
            Ok(Ok(None)) => {
                return Err(Error::Connection(format!(
                    "{addr} closed the connection during login\n{}",
                    self.tail.lock().await.snapshot()
                )))
            }
            Ok(Err(e)) => return Err(Error::Connection(format!("login read failed: {e}"))),
            Err(_) => return Err(Error::Connection("no login response from server".to_string())),
        };

        if resp.contains("unverified") && self.cfg.passcode.is_some() {
            return Err(Error::Connection(format!(
                "login rejected for {}: {resp}",
                self.cfg.login_callsign
            )));
        }
        info!(server = %addr, response = %resp, "APRS-IS login complete");

        let closed = CancellationToken::new();
        Ok(Connection {
            writer,
            reader: spawn_reader(lines, self.tail.clone(), closed.clone()),
            closed,
        })
    }

    async fn await_logresp(
        &self,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
    ) -> std::io::Result<Option<String>> {
        while let Some(line) = lines.next_line().await? {
            debug!(%line, "APRS-IS server");
            let resp = line.strip_prefix("# logresp").map(|r| r.trim().to_string());
            self.tail.lock().await.push_line(line);
            if resp.is_some() {
                return Ok(resp);
            }
        }
        Ok(None)
    }

    /// Make sure `slot` holds a live connection.
    async fn ensure_connected(&self, slot: &mut Option<Connection>) -> Result<()> {
        if slot.as_ref().is_some_and(|c| !c.is_alive()) {
            debug!("dropping dead APRS-IS connection");
            *slot = None;
        }
        if slot.is_none() {
            *slot = Some(self.open().await?);
        }
        Ok(())
    }
}

fn spawn_reader(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    tail: Arc<Mutex<ServerTail>>,
    closed: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(%line, "APRS-IS server");
                    tail.lock().await.push_line(line);
                }
                Ok(None) => {
                    info!("APRS-IS server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "APRS-IS read failed");
                    break;
                }
            }
        }
        closed.cancel();
    })
}

#[async_trait]
impl AprsUplink for AprsIsClient {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard).await
    }

    async fn send(&self, line: &str) -> Result<()> {
        if line.contains(['\r', '\n']) {
            return Err(Error::Validation(
                "packet must not contain line breaks".to_string(),
            ));
        }
        let payload = format!("{line}\r\n");

        let mut guard = self.conn.lock().await;
        let mut reconnects_left = self.cfg.reconnect_attempts.max(1);
        let mut last_err = None;

        loop {
            if !guard.as_ref().is_some_and(Connection::is_alive) {
                if reconnects_left == 0 {
                    break;
                }
                reconnects_left -= 1;
                if last_err.is_some() && !self.cfg.reconnect_backoff.is_zero() {
                    sleep(self.cfg.reconnect_backoff).await;
                }
                *guard = None;
                match self.open().await {
                    Ok(conn) => *guard = Some(conn),
                    Err(e) => {
                        warn!(reconnects_left, error = %e, "APRS-IS connect failed");
                        last_err = Some(e);
                        continue;
                    }
                }
            }
            let Some(conn) = guard.as_mut() else {
                continue;
            };

            match conn.write_line(&payload, self.cfg.io_timeout).await {
                Ok(()) => {
                    debug!(%line, "packet written");
                    return Ok(());
                }
                Err(e) => {
                    warn!(reconnects_left, error = %e, "APRS-IS write failed, dropping connection");
                    *guard = None;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Connection("not connected".to_string())))
    }

    async fn close(&self) -> Result<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        conn.closed.cancel();
        if let Err(e) = conn.writer.shutdown().await {
            debug!(error = %e, "APRS-IS shutdown failed");
        }
        info!("APRS-IS connection closed");
        Ok(())
    }
}
