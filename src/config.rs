use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::EndpointId,
    error::Error,
    serial::line_config::{FlowControl, LineConfig, LineDefaults, Parity},
};

/// The default port to run the relay on.
pub const DEFAULT_PORT: u16 = 3000;

/// The serial port used when nothing else is given.
pub const DEFAULT_TTY: &str = "/dev/ttyS0";

/// How the serial worker paces writes and reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Pause after each write, letting the device act on it.
    pub settle_delay_ms: u64,

    /// Most bytes read from the line in one go.
    pub read_chunk_size: usize,

    /// How long one read keeps accumulating once data showed up.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            read_chunk_size: 128,
            read_timeout_ms: 100,
        }
    }
}

impl SerialConfig {
    /// The settle delay as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// The read timeout as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Where and how the relay listens for clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to listen on.
    pub host: IpAddr,

    /// Port to listen on.
    /// Zero lets the OS pick one.
    pub port: u16,

    /// Relay what a client sends to every other client as well.
    pub echo_to_peers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            echo_to_peers: false,
        }
    }
}

impl RelayConfig {
    /// The socket address to bind.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// The configuration used for running the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The serial line settings.
    /// Anything left out falls back to the usual 9600 8N1.
    pub line: LineDefaults,

    /// Write and read pacing.
    pub serial: SerialConfig,

    /// The network side.
    pub relay: RelayConfig,

    /// Bridge to an in-memory line with this name instead of the serial port.
    pub mock: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            line: LineDefaults::for_port(DEFAULT_TTY),
            serial: SerialConfig::default(),
            relay: RelayConfig::default(),
            mock: None,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not a valid configuration: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let p = p.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::BadConfig(format!("Could not read {p:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// An example configuration with every field filled in.
    pub fn example() -> Self {
        Self {
            line: LineDefaults {
                port: Some("/dev/ttyUSB0".into()),
                baud_rate: Some(115200),
                parity: Some(Parity::Even),
                character_size: Some(7),
                stop_bits: Some(true),
                flow_control: Some(FlowControl::Rts),
            },
            serial: SerialConfig::default(),
            relay: RelayConfig::default(),
            mock: None,
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::InternalIssue(format!("Could not serialize config: {e}")))
    }

    /// The line settings, resolved and checked.
    pub fn line_config(&self) -> Result<LineConfig, Error> {
        LineConfig::new(&self.line)
    }

    /// Which line the relay bridges to.
    pub fn endpoint_id(&self) -> Result<EndpointId, Error> {
        match &self.mock {
            Some(name) => Ok(EndpointId::Mock(name.clone())),
            None => Ok(EndpointId::Tty(self.line_config()?.port().to_string())),
        }
    }

    fn check_serial_timing(&self) -> Result<(), Error> {
        if self.serial.read_chunk_size == 0 {
            return Err(Error::BadConfig(
                "serial.read_chunk_size must be at least one byte".into(),
            ));
        }

        Ok(())
    }

    fn check_line_target(&self) -> Result<(), Error> {
        match &self.mock {
            Some(name) if name.trim().is_empty() => {
                Err(Error::BadConfig("A mock line needs a name".into()))
            }
            Some(_) => Ok(()),
            None if self.line_config()?.port().as_str().is_empty() => Err(Error::BadConfig(
                "No serial port given, set `line.port` or pass a device".into(),
            )),
            None => Ok(()),
        }
    }

    /// Check that the configuration can be used to start a relay.
    pub fn validate(&self) -> Result<(), Error> {
        self.line_config()?;
        self.check_serial_timing()?;
        self.check_line_target()?;

        Ok(())
    }
}
