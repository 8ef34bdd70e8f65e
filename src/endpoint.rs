use std::fmt::Display;

use futures::channel::mpsc;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};

use crate::{
    error::Error,
    serial::{SerialMessage, SerialMessageBytes},
};

pub(crate) mod mock;
pub(crate) mod serial;

/// The line a relay is bridging to.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum EndpointId {
    /// A tty endpoint.
    Tty(String),

    /// An in-memory line which answers with whatever it is given.
    Mock(String),
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointId::Tty(tty) => {
                // Reduce log verbosity
                let tty = if let Some(tty) = tty.strip_prefix("/dev/serial/by-id/") {
                    tty
                } else {
                    tty
                };

                write!(f, "tty: {tty}")
            }
            EndpointId::Mock(mock) => write!(f, "mock: {mock}"),
        }
    }
}

/// An event on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The endpoint put the given message on wire.
    ToWire(SerialMessageBytes),

    /// The endpoint received the following message from wire.
    FromWire(SerialMessageBytes),

    /// The endpoint stopped, and the line is released.
    Closed,
}

impl Display for EndpointEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            EndpointEvent::ToWire(b) => {
                write!(f, "ToWire: {}", SerialMessage::new_lossy(b))
            }
            EndpointEvent::FromWire(b) => {
                write!(f, "FromWire: {}", SerialMessage::new_lossy(b))
            }
            EndpointEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl EndpointEvent {
    /// Attempt to unwrap the event as something that was sent to wire.
    pub fn as_to_wire(&self) -> Option<&SerialMessageBytes> {
        if let Self::ToWire(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Attempt to unwrap the event as something that was received from wire.
    pub fn as_from_wire(&self) -> Option<&SerialMessageBytes> {
        if let Self::FromWire(v) = self {
            Some(v)
        } else {
            None
        }
    }
}

/// How many writes may wait for the line before more are dropped.
pub(crate) const WRITE_QUEUE_DEPTH: usize = 64;

/// Ask an endpoint to put a message on the wire.
/// The outcome is sent back once the write (and its settle delay) is done.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub(crate) message: SerialMessageBytes,
    pub(crate) reply: oneshot::Sender<Result<(), Error>>,
}

impl WriteRequest {
    pub(crate) fn new(message: SerialMessageBytes) -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let (reply, outcome) = oneshot::channel();

        (Self { message, reply }, outcome)
    }
}

/// An endpoint is something which can accept serial messages for writing,
/// and generates serial messages for reading.
pub(crate) trait Endpoint {
    /// Get a receiver of what happens on the wire.
    fn events(&self) -> broadcast::Receiver<EndpointEvent>;

    /// Writes are performed in the order they are sent here.
    /// The queue holds about [`WRITE_QUEUE_DEPTH`] requests.
    fn message_sender(&self) -> mpsc::Sender<WriteRequest>;

    /// Which line this is.
    fn endpoint_id(&self) -> EndpointId;

    /// Stop the endpoint.
    /// The line is released when the returned handle resolves.
    fn close(self: Box<Self>) -> JoinHandle<()>;
}
