use std::{fmt::Display, net::SocketAddr};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::Error, serial::SerialMessageBytes};

/// Identifies a client connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first group is plenty to tell clients apart in logs.
        let id = self.0.to_string();
        let short = id.split('-').next().unwrap_or(&id);

        write!(f, "{short}")
    }
}

/// What the writing half of a connection should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Send this to the client.
    Message(SerialMessageBytes),

    /// Say goodbye and hang up.
    Close,
}

/// One client's session, as seen by the relay.
///
/// The transport itself lives in the websocket tasks.
/// The relay only holds the outbox feeding the writing half.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl Connection {
    /// A new connection, and the receiving end of its outbox.
    pub fn new(remote: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbox, inbox) = mpsc::unbounded_channel();

        (
            Self {
                id: ConnectionId::new(),
                remote,
                outbox,
            },
            inbox,
        )
    }

    /// The identity of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Where the client connected from.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// True while somebody still drains the outbox.
    pub fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }

    /// Queue data for the client.
    pub fn send(&self, data: SerialMessageBytes) -> Result<(), Error> {
        self.outbox
            .send(Outgoing::Message(data))
            .map_err(|_| Error::Io(format!("connection {} is closed", self.id)))
    }

    /// Ask the writing half to hang up.
    /// Closing twice is harmless.
    pub fn close(&self) {
        let _ = self.outbox.send(Outgoing::Close);
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.remote)
    }
}
