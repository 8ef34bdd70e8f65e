use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::unix::fs::OpenOptionsExt,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::fcntl::OFlag;
use tokio::{io::unix::AsyncFd, process::Command, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    error::Error,
    serial::{
        line_config::{LineConfig, CONFIG_TOOL},
        SerialMessage, SerialMessageBytes,
    },
};

/// What an external command produced.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// How the process exited.
    pub status: ExitStatus,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

enum ChannelState {
    Closed,
    Open(AsyncFd<File>),
}

/// A serial line.
///
/// The line is set up via `stty` when opened, then the device is opened
/// non-blocking and registered with the reactor.
/// While open, the [`LineConfig`] is locked.
pub struct SerialChannel {
    config: LineConfig,
    state: ChannelState,
}

impl SerialChannel {
    /// Create a closed channel.
    ///
    /// Fails if the host is not linux or if `stty` is unavailable.
    pub async fn new(config: LineConfig) -> Result<Self, Error> {
        check_platform(std::env::consts::OS)?;
        check_tool(CONFIG_TOOL).await?;

        Ok(Self {
            config,
            state: ChannelState::Closed,
        })
    }

    /// Borrow the line configuration.
    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    /// Mutably borrow the line configuration.
    /// Setters fail while the channel is open.
    pub fn config_mut(&mut self) -> &mut LineConfig {
        &mut self.config
    }

    /// Whether the channel is open.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open(_))
    }

    /// Run a command through `sh -c`, capturing its output.
    ///
    /// A non-zero exit is not an error here, check [`CommandOutput::success`].
    pub async fn exec(command: &str) -> Result<CommandOutput, Error> {
        trace!(%command, "Exec");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::CommandExecution {
                command: command.into(),
                problem: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Apply the line configuration and open the device.
    pub async fn open(&mut self) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }

        let command = self.config.build_setup_command().to_string();
        let output = Self::exec(&command).await?;

        if !output.success() {
            return Err(Error::CommandExecution {
                command,
                problem: output.stderr.trim().to_string(),
            });
        }

        let port = self.config.port().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NONBLOCK | OFlag::O_NOCTTY).bits())
            .open(&port)
            .map_err(|e| Error::Io(format!("Could not open `{port}`: {e}")))?;

        self.state = ChannelState::Open(AsyncFd::new(file)?);
        self.config.lock();

        info!(%command, "Line open");

        Ok(())
    }

    /// Write all of `message`, then let the device settle for `settle_delay`.
    ///
    /// The settle delay is a timer, so other tasks keep running meanwhile.
    pub async fn write(
        &mut self,
        message: &[u8],
        settle_delay: Duration,
    ) -> Result<(), Error> {
        let stream = match &self.state {
            ChannelState::Open(stream) => stream,
            ChannelState::Closed => return Err(Error::NotOpen),
        };

        let mut written = 0;
        while written < message.len() {
            let mut guard = stream.writable().await?;

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(&message[written..])
            }) {
                Ok(Ok(0)) => return Err(Error::Io("The device accepted no bytes".into())),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }

        trace!(message = %SerialMessage::new_lossy(message), "Written");

        if !settle_delay.is_zero() {
            tokio::time::sleep(settle_delay).await;
        }

        Ok(())
    }

    /// Wait until the device has something to read.
    /// Nothing is consumed, so this may be cancelled freely.
    pub async fn readable(&mut self) -> Result<(), Error> {
        let stream = match &self.state {
            ChannelState::Open(stream) => stream,
            ChannelState::Closed => return Err(Error::NotOpen),
        };

        let _guard = stream.readable().await?;

        Ok(())
    }

    /// Read until `max_len` bytes have arrived or `timeout` has passed.
    ///
    /// Running out of time is not an error: whatever arrived is returned,
    /// which may be nothing. Empty reads from the device are skipped.
    pub async fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<SerialMessageBytes, Error> {
        let stream = match &self.state {
            ChannelState::Open(stream) => stream,
            ChannelState::Closed => return Err(Error::NotOpen),
        };

        let deadline = Instant::now() + timeout;
        let mut buffer = vec![0; max_len];
        let mut filled = 0;

        while filled < max_len {
            let mut guard = match tokio::time::timeout_at(deadline, stream.readable()).await {
                Ok(guard) => guard?,
                Err(_elapsed) => break,
            };

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buffer[filled..])
            }) {
                // A tty gives zero bytes for an end-of-file character, the line stays usable.
                // Readiness is kept so whatever follows is read before the deadline.
                Ok(Ok(0)) => {
                    trace!("Empty read");
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }

        buffer.truncate(filled);

        Ok(buffer.into())
    }

    /// Release the device and unlock the configuration.
    pub fn close(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::Open(stream) => {
                drop(stream.into_inner());
                self.config.unlock();
                info!(port = %self.config.port(), "Line closed");
                Ok(())
            }
            ChannelState::Closed => Err(Error::AlreadyClosed),
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(port = %self.config.port(), "Line dropped while open");
        }
    }
}

fn check_platform(os: &str) -> Result<(), Error> {
    match os {
        "linux" => Ok(()),
        other => Err(Error::UnsupportedPlatform(other.into())),
    }
}

async fn check_tool(tool: &str) -> Result<(), Error> {
    match SerialChannel::exec(&format!("{tool} --version")).await {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => {
            debug!(%tool, stderr = %output.stderr.trim(), "Tool check failed");
            Err(Error::ToolUnavailable(tool.into()))
        }
        Err(e) => {
            debug!(%tool, ?e, "Tool check could not run");
            Err(Error::ToolUnavailable(tool.into()))
        }
    }
}
