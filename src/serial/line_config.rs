//! Line settings and the `stty` command derived from them.

use std::{cell::OnceCell, fmt::Display, str::FromStr};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The tool used to apply line settings.
pub const CONFIG_TOOL: &str = "stty";

/// `COM<N>` ports are rewritten to this base, numbered from zero.
const COM_PORT_BASE: &str = "/dev/ttyS";

/// The baud rates a line may be set to.
pub const BAUD_RATES: [u32; 25] = [
    110, 150, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800,
    500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000, 2500000, 3000000, 3500000,
    4000000,
];

/// A standard baud rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaudRate(u32);

impl BaudRate {
    /// Validate a baud rate against [`BAUD_RATES`].
    pub fn new(rate: u32) -> Result<Self, Error> {
        if BAUD_RATES.contains(&rate) {
            Ok(Self(rate))
        } else {
            Err(Error::invalid(
                "baud_rate",
                format!("{rate} is not a standard baud rate"),
            ))
        }
    }

    /// The rate in bits per second.
    pub fn get(&self) -> u32 {
        self.0
    }

    fn token(&self) -> String {
        self.0.to_string()
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self(9600)
    }
}

impl Display for BaudRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parity checking on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,

    /// Even parity.
    Even,

    /// Odd parity.
    Odd,
}

impl Parity {
    fn token(&self) -> &'static str {
        match self {
            Parity::None => "-parenb",
            Parity::Even => "parenb -parodd",
            Parity::Odd => "parenb parodd",
        }
    }
}

impl FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "even" => Ok(Self::Even),
            "odd" => Ok(Self::Odd),
            other => Err(Error::invalid(
                "parity",
                format!("`{other}` is not one of none, even, odd"),
            )),
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacterSize(u8);

impl CharacterSize {
    /// Validate a character size, which must be within 5 to 8 bits.
    pub fn new(bits: u8) -> Result<Self, Error> {
        if (5..=8).contains(&bits) {
            Ok(Self(bits))
        } else {
            Err(Error::invalid(
                "character_size",
                format!("{bits} is outside of 5 to 8 bits"),
            ))
        }
    }

    /// Bits per character.
    pub fn get(&self) -> u8 {
        self.0
    }

    fn token(&self) -> String {
        format!("cs{}", self.0)
    }
}

impl Default for CharacterSize {
    fn default() -> Self {
        Self(8)
    }
}

/// Stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,

    /// Two stop bits.
    Two,
}

impl StopBits {
    // `StopBits::from(false)` is `One` and emits `cstopb`, `true` is `Two` and emits `-cstopb`.
    fn token(&self) -> &'static str {
        match self {
            StopBits::One => "cstopb",
            StopBits::Two => "-cstopb",
        }
    }
}

impl From<bool> for StopBits {
    fn from(two: bool) -> Self {
        if two {
            Self::Two
        } else {
            Self::One
        }
    }
}

/// Flow control on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,

    /// RTS only.
    Rts,

    /// CTS only.
    Cts,

    /// RTS/CTS.
    RtsCts,
}

impl FlowControl {
    fn token(&self) -> &'static str {
        match self {
            FlowControl::None => "",
            FlowControl::Rts => "-crtscts",
            FlowControl::Cts => "-ccts",
            FlowControl::RtsCts => "-crtscts",
        }
    }
}

impl FromStr for FlowControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "rts" => Ok(Self::Rts),
            "cts" => Ok(Self::Cts),
            "rtscts" => Ok(Self::RtsCts),
            other => Err(Error::invalid(
                "flow_control",
                format!("`{other}` is not one of none, rts, cts, rtscts"),
            )),
        }
    }
}

/// The device path of a line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Port(String);

impl Port {
    /// A port from a path.
    ///
    /// `COM<N>` (any case, optionally followed by `:`) becomes `/dev/ttyS<N-1>`,
    /// anything else is used as is.
    pub fn new(port: &str) -> Result<Self, Error> {
        match com_port_number(port) {
            Some(0) => Err(Error::invalid(
                "port",
                format!("`{port}` is not a valid COM port, numbering starts at 1"),
            )),
            Some(n) => Ok(Self(format!("{COM_PORT_BASE}{}", n - 1))),
            None => Ok(Self(port.into())),
        }
    }

    /// Borrow the path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn token(&self) -> String {
        if self.0.is_empty() {
            String::new()
        } else {
            format!("-F {}", self.0)
        }
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn com_port_number(port: &str) -> Option<u32> {
    let prefix = port.get(..3)?;
    if !prefix.eq_ignore_ascii_case("com") {
        return None;
    }

    let digits = port[3..].strip_suffix(':').unwrap_or(&port[3..]);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

/// Line settings as they appear in a configuration file.
/// Anything left out falls back to 9600 baud, 8 data bits,
/// no parity, one stop bit and no flow control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineDefaults {
    /// Device path, or `COM<N>`.
    pub port: Option<String>,

    /// See [`BAUD_RATES`].
    pub baud_rate: Option<u32>,

    /// See [`Parity`].
    pub parity: Option<Parity>,

    /// Data bits, 5 to 8.
    pub character_size: Option<u8>,

    /// `true` for two stop bits.
    pub stop_bits: Option<bool>,

    /// See [`FlowControl`].
    pub flow_control: Option<FlowControl>,
}

impl LineDefaults {
    /// Defaults for the given port, everything else left to fallbacks.
    pub fn for_port(port: &str) -> Self {
        Self {
            port: Some(port.into()),
            ..Default::default()
        }
    }
}

// Validated form of `LineDefaults`.
#[derive(Debug, Clone, Default)]
struct Fallbacks {
    port: Port,
    baud_rate: BaudRate,
    parity: Parity,
    character_size: CharacterSize,
    stop_bits: StopBits,
    flow_control: FlowControl,
}

impl TryFrom<&LineDefaults> for Fallbacks {
    type Error = Error;

    fn try_from(defaults: &LineDefaults) -> Result<Self, Self::Error> {
        Ok(Self {
            port: defaults
                .port
                .as_deref()
                .map(Port::new)
                .transpose()?
                .unwrap_or_default(),
            baud_rate: defaults
                .baud_rate
                .map(BaudRate::new)
                .transpose()?
                .unwrap_or_default(),
            parity: defaults.parity.unwrap_or_default(),
            character_size: defaults
                .character_size
                .map(CharacterSize::new)
                .transpose()?
                .unwrap_or_default(),
            stop_bits: defaults.stop_bits.map(StopBits::from).unwrap_or_default(),
            flow_control: defaults.flow_control.unwrap_or_default(),
        })
    }
}

/// The settings of a serial line.
///
/// Fields which are never set explicitly are resolved from the [`LineDefaults`]
/// the first time they are read.
/// While the owning channel is open the configuration is locked, and every setter fails.
#[derive(Debug, Clone)]
pub struct LineConfig {
    fallbacks: Fallbacks,
    locked: bool,

    port: OnceCell<Port>,
    baud_rate: OnceCell<BaudRate>,
    parity: OnceCell<Parity>,
    character_size: OnceCell<CharacterSize>,
    stop_bits: OnceCell<StopBits>,
    flow_control: OnceCell<FlowControl>,

    setup_command: OnceCell<String>,
}

impl LineConfig {
    /// Create a configuration from defaults.
    /// The defaults are validated right away.
    pub fn new(defaults: &LineDefaults) -> Result<Self, Error> {
        Ok(Self {
            fallbacks: Fallbacks::try_from(defaults)?,
            locked: false,
            port: OnceCell::new(),
            baud_rate: OnceCell::new(),
            parity: OnceCell::new(),
            character_size: OnceCell::new(),
            stop_bits: OnceCell::new(),
            flow_control: OnceCell::new(),
            setup_command: OnceCell::new(),
        })
    }

    /// Whether the owning channel is open.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }

    fn ensure_unlocked(&self, field: &str) -> Result<(), Error> {
        if self.locked {
            Err(Error::ConfigLocked(field.into()))
        } else {
            Ok(())
        }
    }

    // Any change means the command has to be derived again.
    fn changed(&mut self) {
        self.setup_command = OnceCell::new();
    }

    /// Set the device path. See [`Port::new`].
    pub fn set_port(&mut self, port: &str) -> Result<(), Error> {
        self.ensure_unlocked("port")?;
        self.port = OnceCell::from(Port::new(port)?);
        self.changed();
        Ok(())
    }

    /// Set the baud rate. See [`BAUD_RATES`].
    pub fn set_baud_rate(&mut self, rate: u32) -> Result<(), Error> {
        self.ensure_unlocked("baud_rate")?;
        self.baud_rate = OnceCell::from(BaudRate::new(rate)?);
        self.changed();
        Ok(())
    }

    /// Set the parity.
    pub fn set_parity(&mut self, parity: Parity) -> Result<(), Error> {
        self.ensure_unlocked("parity")?;
        self.parity = OnceCell::from(parity);
        self.changed();
        Ok(())
    }

    /// Set the number of data bits, 5 to 8.
    pub fn set_character_size(&mut self, bits: u8) -> Result<(), Error> {
        self.ensure_unlocked("character_size")?;
        self.character_size = OnceCell::from(CharacterSize::new(bits)?);
        self.changed();
        Ok(())
    }

    /// Set two stop bits (`true`) or one (`false`).
    pub fn set_stop_bits(&mut self, two: bool) -> Result<(), Error> {
        self.ensure_unlocked("stop_bits")?;
        self.stop_bits = OnceCell::from(StopBits::from(two));
        self.changed();
        Ok(())
    }

    /// Set the flow control.
    pub fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), Error> {
        self.ensure_unlocked("flow_control")?;
        self.flow_control = OnceCell::from(flow_control);
        self.changed();
        Ok(())
    }

    /// The device path.
    pub fn port(&self) -> &Port {
        self.port.get_or_init(|| self.fallbacks.port.clone())
    }

    /// The baud rate.
    pub fn baud_rate(&self) -> BaudRate {
        *self.baud_rate.get_or_init(|| self.fallbacks.baud_rate)
    }

    /// The parity.
    pub fn parity(&self) -> Parity {
        *self.parity.get_or_init(|| self.fallbacks.parity)
    }

    /// The number of data bits.
    pub fn character_size(&self) -> CharacterSize {
        *self.character_size.get_or_init(|| self.fallbacks.character_size)
    }

    /// The stop bits.
    pub fn stop_bits(&self) -> StopBits {
        *self.stop_bits.get_or_init(|| self.fallbacks.stop_bits)
    }

    /// The flow control.
    pub fn flow_control(&self) -> FlowControl {
        *self.flow_control.get_or_init(|| self.fallbacks.flow_control)
    }

    /// Whether the port has been set or resolved.
    pub fn has_port(&self) -> bool {
        self.port.get().is_some()
    }

    /// Whether the baud rate has been set or resolved.
    pub fn has_baud_rate(&self) -> bool {
        self.baud_rate.get().is_some()
    }

    /// Whether the parity has been set or resolved.
    pub fn has_parity(&self) -> bool {
        self.parity.get().is_some()
    }

    /// Whether the character size has been set or resolved.
    pub fn has_character_size(&self) -> bool {
        self.character_size.get().is_some()
    }

    /// Whether the stop bits have been set or resolved.
    pub fn has_stop_bits(&self) -> bool {
        self.stop_bits.get().is_some()
    }

    /// Whether the flow control has been set or resolved.
    pub fn has_flow_control(&self) -> bool {
        self.flow_control.get().is_some()
    }

    /// The command which applies these settings to the device, e.g.
    /// `stty -F /dev/ttyS0 9600 cs8 cstopb -parenb`.
    ///
    /// Tokens are in the order port, baud rate, character size, stop bits,
    /// parity, flow control. Empty tokens are left out.
    pub fn build_setup_command(&self) -> &str {
        self.setup_command.get_or_init(|| {
            let tokens = [
                self.port().token(),
                self.baud_rate().token(),
                self.character_size().token(),
                self.stop_bits().token().to_string(),
                self.parity().token().to_string(),
                self.flow_control().token().to_string(),
            ];

            std::iter::once(CONFIG_TOOL.to_string())
                .chain(tokens.into_iter().filter(|token| !token.is_empty()))
                .join(" ")
        })
    }
}

impl Display for LineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {} {:?}/{}/{:?}/{:?}",
            self.port(),
            self.baud_rate(),
            self.parity(),
            self.character_size().get(),
            self.stop_bits(),
            self.flow_control()
        )
    }
}
