#![deny(missing_docs)]

//! This crate bridges websocket clients to a single serial line.
//!
//! The line is set up with `stty` when it is opened, using the settings
//! in [`serial::line_config::LineConfig`]. Those settings are locked for as long as the
//! line is open.
//!
//! Whatever a client sends is written to the line in arrival order,
//! followed by a short settle delay.
//! Whatever the device says is broadcast to every connected client.
//!
//! A mock line which answers with whatever it is given can be used
//! in place of a device, which is how most of the tests run.

/// Code relating to setting up a server.
pub mod server;

/// Possible errors in this library.
pub mod error;

/// Serial lines: settings, the channel, and its worker task.
pub mod serial;

/// A client connection as the relay sees it.
pub mod connection;

/// The set of attached client connections.
pub mod registry;

/// Configuration of the relay.
pub mod config;

/// The command line interface.
pub mod cli;

/// Logging setup.
pub mod logging;

/// Things which put bytes on a wire.
pub mod endpoint;

/// An in-memory line.
pub(crate) mod mock;

/// The task tying clients and the line together.
pub(crate) mod relay;

pub(crate) mod websocket;
