use std::io;

use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A line setting was given a value outside of what it accepts.
    #[error("Invalid value for `{field}`: {problem}")]
    ConfigInvalid {
        /// The setting in question, e.g. `baud_rate`.
        field: String,

        /// What was wrong with the value.
        problem: String,
    },

    /// A line setting was changed while the line is open.
    #[error("The line configuration is locked while the line is open, cannot change `{0}`")]
    ConfigLocked(String),

    /// Tried opening a channel which is open.
    #[error("The serial channel is already open")]
    AlreadyOpen,

    /// Tried using a channel which has not been opened.
    #[error("The serial channel is not open")]
    NotOpen,

    /// Tried closing a channel which is closed.
    #[error("The serial channel is already closed")]
    AlreadyClosed,

    /// An external command could not be launched, or it failed.
    #[error("Command `{command}` failed. Problem: {problem}")]
    CommandExecution {
        /// The command line.
        command: String,

        /// Captured standard error, or the reason the command could not start.
        problem: String,
    },

    /// Underlying IO problem.
    #[error("IO problem: {0}")]
    Io(String),

    /// The host is not running an operating system we can drive lines on.
    #[error("Unsupported platform `{0}`, only linux is supported")]
    UnsupportedPlatform(String),

    /// The line configuration tool is missing.
    #[error("The line configuration tool `{0}` is not available")]
    ToolUnavailable(String),

    /// The configuration could not be used.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Something went wrong internally.
    #[error("Internal issue: {0}")]
    InternalIssue(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl Error {
    pub(crate) fn invalid<F: AsRef<str>, P: AsRef<str>>(field: F, problem: P) -> Self {
        Self::ConfigInvalid {
            field: field.as_ref().into(),
            problem: problem.as_ref().into(),
        }
    }

    /// The offending field if this is a [`Error::ConfigInvalid`].
    pub fn invalid_field(&self) -> Option<&str> {
        if let Self::ConfigInvalid { field, .. } = self {
            Some(field)
        } else {
            None
        }
    }
}
