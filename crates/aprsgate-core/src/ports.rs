use async_trait::async_trait;

use crate::Result;

/// Hexagonal port for the outbound packet network.
///
/// The production implementation is the APRS-IS TCP client; implementations must
/// serialize `send` so concurrent callers never interleave bytes on the wire.
#[async_trait]
pub trait AprsUplink: Send + Sync {
    /// Establish the connection and log in (no-op when already connected).
    async fn connect(&self) -> Result<()>;

    /// Transmit one packet line (without line terminator).
    async fn send(&self, line: &str) -> Result<()>;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<()>;
}
