use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::{
    connection::{Connection, ConnectionId},
    serial::SerialMessageBytes,
};

/// The clients currently attached to the relay.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    /// Returns false if it was already attached, in which case nothing changes.
    pub fn attach(&mut self, connection: Connection) -> bool {
        let id = connection.id();

        if self.connections.contains_key(&id) {
            debug!(%id, "Already attached");
            return false;
        }

        self.connections.insert(id, connection);
        debug!(%id, attached = self.connections.len(), "Attached");

        true
    }

    /// Remove a connection.
    /// Detaching an unknown connection does nothing.
    pub fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);

        if removed.is_some() {
            debug!(%id, attached = self.connections.len(), "Detached");
        }

        removed
    }

    /// Look up an attached connection.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Is this connection attached?
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when nobody is attached.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Every attached connection.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Send `data` to every member except `excluding`.
    ///
    /// Members that cannot be sent to are detached once everybody else has been served.
    /// Their ids are returned.
    pub fn broadcast(
        &mut self,
        data: &SerialMessageBytes,
        excluding: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let mut failed = vec![];
        let mut delivered = 0;

        for (id, connection) in &self.connections {
            if Some(*id) == excluding {
                continue;
            }

            match connection.send(data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(%id, ?e, "Could not deliver, dropping connection");
                    failed.push(*id);
                }
            }
        }

        for id in &failed {
            self.connections.remove(id);
        }

        trace!(delivered, failed = failed.len(), "Broadcast done");

        failed
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::connection::Outgoing;

    fn connection() -> (Connection, UnboundedReceiver<Outgoing>) {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Connection::new(addr)
    }

    fn received(inbox: &mut UnboundedReceiver<Outgoing>) -> Vec<Outgoing> {
        let mut messages = vec![];
        while let Ok(message) = inbox.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn attach_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let (a, _a) = connection();

        assert!(registry.attach(a.clone()));
        assert!(!registry.attach(a.clone()));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(a.id()));
    }

    #[test]
    fn detach_unknown_is_noop() {
        let mut registry = ConnectionRegistry::new();
        let (a, _a) = connection();
        let (b, _b) = connection();

        registry.attach(a.clone());

        assert!(registry.detach(b.id()).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.detach(a.id()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_everyone_but_excluded() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut a_inbox) = connection();
        let (b, mut b_inbox) = connection();
        let (c, mut c_inbox) = connection();

        registry.attach(a.clone());
        registry.attach(b);
        registry.attach(c);

        let failed = registry.broadcast(&"hello".into(), Some(a.id()));
        assert!(failed.is_empty());

        assert!(received(&mut a_inbox).is_empty());
        assert_eq!(
            received(&mut b_inbox),
            vec![Outgoing::Message("hello".into())]
        );
        assert_eq!(
            received(&mut c_inbox),
            vec![Outgoing::Message("hello".into())]
        );
    }

    #[test]
    fn broadcast_without_exclusion_reaches_everyone() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut a_inbox) = connection();
        let (b, mut b_inbox) = connection();

        registry.attach(a);
        registry.attach(b);

        registry.broadcast(&"ack".into(), None);

        assert_eq!(received(&mut a_inbox), vec![Outgoing::Message("ack".into())]);
        assert_eq!(received(&mut b_inbox), vec![Outgoing::Message("ack".into())]);
    }

    #[test]
    fn failing_member_does_not_stop_delivery() {
        let mut registry = ConnectionRegistry::new();
        let (a, a_inbox) = connection();
        let (b, mut b_inbox) = connection();
        let (c, mut c_inbox) = connection();

        let a_id = a.id();
        registry.attach(a);
        registry.attach(b);
        registry.attach(c);

        // Nobody drains A anymore
        drop(a_inbox);

        let failed = registry.broadcast(&"data".into(), None);

        assert_eq!(failed, vec![a_id]);
        assert!(!registry.contains(a_id));
        assert_eq!(registry.len(), 2);

        assert_eq!(received(&mut b_inbox), vec![Outgoing::Message("data".into())]);
        assert_eq!(received(&mut c_inbox), vec![Outgoing::Message("data".into())]);
    }
}
