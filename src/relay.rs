//! The relay has control over the line and the attached clients.
//!
//! Every connection event and every line event is handled by a single task,
//! so the registry is only ever touched from one place.

use std::fmt::Debug;

use futures::{channel::mpsc, StreamExt};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    connection::{Connection, ConnectionId},
    endpoint::{Endpoint, EndpointEvent, WriteRequest},
    error::Error,
    registry::ConnectionRegistry,
    serial::{SerialMessage, SerialMessageBytes},
};

/// Inform the relay of events.
pub(crate) enum RelayMessage {
    /// A client connected.
    Opened(Connection),

    /// A client sent something for the line.
    Message {
        from: ConnectionId,
        message: SerialMessageBytes,
    },

    /// A client left.
    Closed(ConnectionId),

    /// A client's transport failed.
    Errored { id: ConnectionId, error: String },

    /// The line could not take what a client sent.
    WriteFailed { origin: ConnectionId, error: Error },
}

impl Debug for RelayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMessage::Opened(connection) => f
                .debug_struct("Opened")
                .field("connection", &connection.to_string())
                .finish(),
            RelayMessage::Message { from, message } => f
                .debug_struct("Message")
                .field("from", &from.to_string())
                .field("message", &SerialMessage::new_lossy(message).to_string())
                .finish(),
            RelayMessage::Closed(id) => f.debug_tuple("Closed").field(&id.to_string()).finish(),
            RelayMessage::Errored { id, error } => f
                .debug_struct("Errored")
                .field("id", &id.to_string())
                .field("error", error)
                .finish(),
            RelayMessage::WriteFailed { origin, error } => f
                .debug_struct("WriteFailed")
                .field("origin", &origin.to_string())
                .field("error", error)
                .finish(),
        }
    }
}

/// Reach the relay task.
#[derive(Debug, Clone)]
pub(crate) struct RelayHandle(mpsc::UnboundedSender<RelayMessage>);

impl RelayHandle {
    /// Start relaying between clients and the given line.
    ///
    /// The relay stops when `shutdown` is cancelled, or when the line goes away.
    /// Either way it cancels `shutdown` on its way out and releases the line.
    pub(crate) fn new(
        endpoint: Box<dyn Endpoint + Send + Sync>,
        echo_to_peers: bool,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<Result<(), Error>>) {
        let (tx, rx) = mpsc::unbounded::<RelayMessage>();
        let handle = RelayHandle(tx);

        let relay = RelayServer::new(endpoint, echo_to_peers, rx, handle.clone());
        let span = info_span!("relay", line = %relay.endpoint.endpoint_id());

        let task = tokio::spawn(relay.run(shutdown).instrument(span));

        (handle, task)
    }

    pub(crate) fn inform(&self, information: RelayMessage) {
        if let Err(e) = self.0.unbounded_send(information) {
            debug!(message = ?e.into_inner(), "Relay has stopped, dropping");
        }
    }
}

struct RelayServer {
    messages: mpsc::UnboundedReceiver<RelayMessage>,

    // For the write waiters to report back.
    handle: RelayHandle,

    registry: ConnectionRegistry,

    endpoint: Box<dyn Endpoint + Send + Sync>,
    line_events: broadcast::Receiver<EndpointEvent>,
    line_writer: mpsc::Sender<WriteRequest>,

    echo_to_peers: bool,
}

impl RelayServer {
    fn new(
        endpoint: Box<dyn Endpoint + Send + Sync>,
        echo_to_peers: bool,
        messages: mpsc::UnboundedReceiver<RelayMessage>,
        handle: RelayHandle,
    ) -> Self {
        Self {
            messages,
            handle,
            registry: ConnectionRegistry::new(),
            line_events: endpoint.events(),
            line_writer: endpoint.message_sender(),
            endpoint,
            echo_to_peers,
        }
    }

    fn on_open(&mut self, connection: Connection) {
        info!(%connection, "Client connected");
        self.registry.attach(connection);
    }

    fn on_message(&mut self, from: ConnectionId, message: SerialMessageBytes) {
        if !self.registry.contains(from) {
            debug!(%from, "Message from a detached client, dropping");
            return;
        }

        trace!(%from, message = %SerialMessage::new_lossy(&message), "To line");

        if self.echo_to_peers {
            self.registry.broadcast(&message, Some(from));
        }

        let (request, outcome) = WriteRequest::new(message);

        if let Err(e) = self.line_writer.try_send(request) {
            if e.is_full() {
                warn!(%from, "Line is busy, dropping write");
            } else {
                error!("Line does not take writes anymore");
            }
            return;
        }

        let handle = self.handle.clone();
        tokio::spawn(async move {
            let error = match outcome.await {
                Ok(Ok(())) => return,
                Ok(Err(error)) => error,
                Err(_) => Error::InternalIssue("The line dropped a write request".into()),
            };

            handle.inform(RelayMessage::WriteFailed {
                origin: from,
                error,
            });
        });
    }

    fn on_serial_data(&mut self, data: SerialMessageBytes) {
        trace!(message = %SerialMessage::new_lossy(&data), "From line");
        self.registry.broadcast(&data, None);
    }

    fn on_write_failed(&mut self, origin: ConnectionId, error: Error) {
        warn!(%origin, %error, "Write failed, closing the client");

        if let Some(connection) = self.registry.get(origin) {
            connection.close();
        }
    }

    fn on_close(&mut self, id: ConnectionId) {
        info!(%id, "Client left");
        self.registry.detach(id);
    }

    fn on_error(&mut self, id: ConnectionId, error: String) {
        warn!(%id, %error, "Client errored");

        if let Some(connection) = self.registry.get(id) {
            connection.close();
        }
    }

    fn handle_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Opened(connection) => self.on_open(connection),
            RelayMessage::Message { from, message } => self.on_message(from, message),
            RelayMessage::Closed(id) => self.on_close(id),
            RelayMessage::Errored { id, error } => self.on_error(id, error),
            RelayMessage::WriteFailed { origin, error } => self.on_write_failed(origin, error),
        }
    }

    async fn run(mut self, shutdown: CancellationToken) -> Result<(), Error> {
        info!("Relaying");

        let outcome = loop {
            tokio::select! {
                message = self.messages.next() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break Ok(()),
                    }
                }
                event = self.line_events.recv() => {
                    match event {
                        Ok(EndpointEvent::FromWire(data)) => self.on_serial_data(data),
                        Ok(EndpointEvent::ToWire(data)) => {
                            trace!(message = %SerialMessage::new_lossy(&data), "Put on wire");
                        }
                        Ok(EndpointEvent::Closed) | Err(RecvError::Closed) => {
                            error!("Line closed");
                            break Err(Error::Io(format!(
                                "The line {} closed unexpectedly",
                                self.endpoint.endpoint_id()
                            )));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%skipped, "Relay fell behind the line, messages lost");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Told to stop");
                    break Ok(());
                }
            }
        };

        self.stop().await;
        shutdown.cancel();

        outcome
    }

    async fn stop(self) {
        for connection in self.registry.connections() {
            connection.close();
        }

        let line = self.endpoint.endpoint_id();
        if let Err(e) = self.endpoint.close().await {
            warn!(%line, ?e, "Line task did not end cleanly");
        }

        info!(%line, "Line released");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

    use super::*;
    use crate::{
        connection::Outgoing,
        endpoint::{EndpointId, WRITE_QUEUE_DEPTH},
        mock::{MockBuilder, MockHandle},
    };

    fn connection() -> (Connection, UnboundedReceiver<Outgoing>) {
        Connection::new("127.0.0.1:4000".parse().unwrap())
    }

    async fn next(inbox: &mut UnboundedReceiver<Outgoing>) -> Outgoing {
        timeout(Duration::from_secs(1), inbox.recv())
            .await
            .expect("Should get something in time")
            .expect("Inbox should be open")
    }

    fn start(
        mock: MockHandle,
        echo_to_peers: bool,
    ) -> (RelayHandle, CancellationToken, JoinHandle<Result<(), Error>>) {
        let shutdown = CancellationToken::new();
        let (relay, task) = RelayHandle::new(Box::new(mock), echo_to_peers, shutdown.clone());

        (relay, shutdown, task)
    }

    #[tokio::test]
    async fn line_output_reaches_every_client() {
        let mock = MockBuilder::new("fan-out").build();
        let mut line = mock.events();
        let injector = mock.injector();

        let (relay, shutdown, task) = start(mock, false);

        let (a, mut a_inbox) = connection();
        let (b, mut b_inbox) = connection();
        let (c, mut c_inbox) = connection();
        let a_id = a.id();

        relay.inform(RelayMessage::Opened(a));
        relay.inform(RelayMessage::Opened(b));
        relay.inform(RelayMessage::Opened(c));

        relay.inform(RelayMessage::Message {
            from: a_id,
            message: "fwd".into(),
        });

        assert_eq!(line.recv().await.unwrap(), EndpointEvent::ToWire("fwd".into()));

        // The mock answers with what it was given
        for inbox in [&mut a_inbox, &mut b_inbox, &mut c_inbox] {
            assert_eq!(next(inbox).await, Outgoing::Message("fwd".into()));
        }

        injector.unbounded_send("ack".into()).unwrap();

        for inbox in [&mut a_inbox, &mut b_inbox, &mut c_inbox] {
            assert_eq!(next(inbox).await, Outgoing::Message("ack".into()));
        }

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn writes_keep_their_order() {
        let mock = MockBuilder::new("order").build();
        let mut line = mock.events();

        let (relay, shutdown, task) = start(mock, false);

        let (a, _a_inbox) = connection();
        let a_id = a.id();
        relay.inform(RelayMessage::Opened(a));

        for message in ["one", "two", "three"] {
            relay.inform(RelayMessage::Message {
                from: a_id,
                message: message.into(),
            });
        }

        let mut written = vec![];
        while written.len() < 3 {
            if let EndpointEvent::ToWire(message) = line.recv().await.unwrap() {
                written.push(message);
            }
        }

        assert_eq!(written, vec!["one", "two", "three"]);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn echo_to_peers_skips_the_sender() {
        let mock = MockBuilder::new("echo").build();
        let (relay, shutdown, task) = start(mock, true);

        let (a, mut a_inbox) = connection();
        let (b, mut b_inbox) = connection();
        let (c, mut c_inbox) = connection();
        let a_id = a.id();

        relay.inform(RelayMessage::Opened(a));
        relay.inform(RelayMessage::Opened(b));
        relay.inform(RelayMessage::Opened(c));

        relay.inform(RelayMessage::Message {
            from: a_id,
            message: "hi".into(),
        });

        // Peers get the relayed message and then the line's answer.
        for inbox in [&mut b_inbox, &mut c_inbox] {
            assert_eq!(next(inbox).await, Outgoing::Message("hi".into()));
            assert_eq!(next(inbox).await, Outgoing::Message("hi".into()));
        }

        // The sender only gets the line's answer.
        assert_eq!(next(&mut a_inbox).await, Outgoing::Message("hi".into()));
        assert!(a_inbox.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_failure_closes_only_the_writer() {
        let mock = MockBuilder::new("failing").failing_writes().build();
        let (relay, shutdown, task) = start(mock, false);

        let (a, mut a_inbox) = connection();
        let (b, mut b_inbox) = connection();
        let a_id = a.id();

        relay.inform(RelayMessage::Opened(a));
        relay.inform(RelayMessage::Opened(b));

        relay.inform(RelayMessage::Message {
            from: a_id,
            message: "doomed".into(),
        });

        assert_eq!(next(&mut a_inbox).await, Outgoing::Close);
        assert!(b_inbox.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap().unwrap();

        // Stopping the relay closes whoever is left.
        assert_eq!(next(&mut b_inbox).await, Outgoing::Close);
    }

    #[tokio::test]
    async fn errored_client_is_closed_and_detached() {
        let mock = MockBuilder::new("errored").build();
        let injector = mock.injector();
        let (relay, shutdown, task) = start(mock, false);

        let (a, mut a_inbox) = connection();
        let (b, mut b_inbox) = connection();
        let a_id = a.id();

        relay.inform(RelayMessage::Opened(a));
        relay.inform(RelayMessage::Opened(b));

        relay.inform(RelayMessage::Errored {
            id: a_id,
            error: "connection reset".into(),
        });
        assert_eq!(next(&mut a_inbox).await, Outgoing::Close);

        relay.inform(RelayMessage::Closed(a_id));

        // Line events and client events race, let the relay catch up
        tokio::time::sleep(Duration::from_millis(50)).await;

        injector.unbounded_send("after".into()).unwrap();
        assert_eq!(next(&mut b_inbox).await, Outgoing::Message("after".into()));
        assert!(a_inbox.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    struct ScriptedLine {
        events: broadcast::Sender<EndpointEvent>,
        writes: mpsc::Sender<WriteRequest>,
    }

    impl Endpoint for ScriptedLine {
        fn events(&self) -> broadcast::Receiver<EndpointEvent> {
            self.events.subscribe()
        }

        fn message_sender(&self) -> mpsc::Sender<WriteRequest> {
            self.writes.clone()
        }

        fn endpoint_id(&self) -> EndpointId {
            EndpointId::Mock("scripted".into())
        }

        fn close(self: Box<Self>) -> JoinHandle<()> {
            tokio::spawn(async {})
        }
    }

    #[tokio::test]
    async fn line_closing_stops_the_relay() {
        let (events, _) = broadcast::channel(16);
        let (writes, _writes_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let line = ScriptedLine {
            events: events.clone(),
            writes,
        };

        let shutdown = CancellationToken::new();
        let (relay, task) = RelayHandle::new(Box::new(line), false, shutdown.clone());

        let (a, mut a_inbox) = connection();
        relay.inform(RelayMessage::Opened(a));
        tokio::time::sleep(Duration::from_millis(50)).await;

        events.send(EndpointEvent::FromWire("last words".into())).unwrap();
        assert_eq!(next(&mut a_inbox).await, Outgoing::Message("last words".into()));

        events.send(EndpointEvent::Closed).unwrap();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Err(Error::Io(_))));
        assert!(shutdown.is_cancelled());
        assert_eq!(next(&mut a_inbox).await, Outgoing::Close);
    }

    #[tokio::test]
    async fn stalled_line_drops_writes_beyond_the_queue() {
        let (events, _) = broadcast::channel(16);
        let (writes, mut writes_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let line = ScriptedLine {
            events: events.clone(),
            writes,
        };

        let shutdown = CancellationToken::new();
        let (relay, task) = RelayHandle::new(Box::new(line), false, shutdown.clone());

        let (a, mut a_inbox) = connection();
        let a_id = a.id();
        relay.inform(RelayMessage::Opened(a));

        let sent = WRITE_QUEUE_DEPTH * 2;
        for n in 0..sent {
            relay.inform(RelayMessage::Message {
                from: a_id,
                message: n.to_string().into(),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The relay keeps serving line output while writes pile up
        events.send(EndpointEvent::FromWire("busy".into())).unwrap();
        assert_eq!(next(&mut a_inbox).await, Outgoing::Message("busy".into()));

        // Holding on to the requests keeps their writers waiting
        let mut queued = vec![];
        while let Ok(Some(request)) = writes_rx.try_next() {
            queued.push(request);
        }

        assert!(queued.len() >= WRITE_QUEUE_DEPTH);
        assert!(queued.len() < sent);

        // What made it keeps its order
        assert_eq!(queued[0].message, "0");
        assert_eq!(
            queued[WRITE_QUEUE_DEPTH - 1].message,
            (WRITE_QUEUE_DEPTH - 1).to_string()
        );

        // Dropping a write does not close the writer
        assert!(a_inbox.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
