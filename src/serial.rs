use std::{fmt::Display, time::Duration};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Error;

/// Line settings and the setup command derived from them.
pub mod line_config;

/// The serial channel: setup, open, write, read, close.
pub mod channel;

/// The task owning an open channel.
pub(crate) mod serial_port;

use channel::SerialChannel;
use line_config::LineConfig;

/// The message data type used for serial, when shown to humans.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SerialMessage(String);

impl SerialMessage {
    /// Create a serial message from bytes, ignoring any bad utf8 bytes.
    pub fn new_lossy<B: AsRef<[u8]>>(bytes: B) -> Self {
        Self(String::from_utf8_lossy(bytes.as_ref()).to_string())
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SerialMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.chars().take(48).collect::<String>();

        write!(f, "{}", s.trim())
    }
}

/// The message data type used for serial bytes.
pub type SerialMessageBytes = Bytes;

/// Open a line, write `message` and wait up to `wait` for the device to answer.
///
/// The line is closed again before returning, also when the write fails.
/// An empty answer means the device said nothing in time.
pub async fn probe(
    config: LineConfig,
    message: &[u8],
    settle_delay: Duration,
    wait: Duration,
) -> Result<SerialMessageBytes, Error> {
    let mut channel = SerialChannel::new(config).await?;
    channel.open().await?;

    let answer = exchange(&mut channel, message, settle_delay, wait).await;

    channel.close()?;

    answer
}

async fn exchange(
    channel: &mut SerialChannel,
    message: &[u8],
    settle_delay: Duration,
    wait: Duration,
) -> Result<SerialMessageBytes, Error> {
    info!(message = %SerialMessage::new_lossy(message), "Probing");
    channel.write(message, settle_delay).await?;

    let deadline = Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let answer = channel
            .read(128, remaining.min(Duration::from_secs(1)))
            .await?;

        if !answer.is_empty() {
            return Ok(answer);
        }

        if remaining.is_zero() {
            debug!("No answer");
            return Ok(Bytes::new());
        }
    }
}
