//! A mock, useful to test relay functionality without the actual serial ports.

use futures::{channel::mpsc, StreamExt};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, trace, Instrument};

use crate::{
    endpoint::{EndpointEvent, WriteRequest, WRITE_QUEUE_DEPTH},
    error::Error,
    serial::{SerialMessage, SerialMessageBytes},
};

/// Builder for a [`MockHandle`].
#[derive(Debug)]
pub(crate) struct MockBuilder {
    name: String,
    failing_writes: bool,
}

impl MockBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            failing_writes: false,
        }
    }

    /// Every write fails, and nothing is echoed back.
    #[cfg(test)]
    pub(crate) fn failing_writes(mut self) -> Self {
        self.failing_writes = true;
        self
    }

    #[must_use]
    pub(crate) fn build(self) -> MockHandle {
        info!(name = %self.name, "Running mock");

        let (should_put_on_wire_sender, should_put_on_wire_receiver) =
            mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);
        let (injection_sender, injection_receiver) = mpsc::unbounded::<SerialMessageBytes>();

        enum Event {
            PleasePutThisOnWire(WriteRequest),
            DeviceSaid(SerialMessageBytes),
        }

        let mut events = futures::stream::select(
            should_put_on_wire_receiver.map(Event::PleasePutThisOnWire),
            injection_receiver.map(Event::DeviceSaid),
        );

        // Outsiders will be getting observing messages from this broadcast.
        let (broadcast_sender, _) = broadcast::channel(1024);
        let broadcast_sender_task = broadcast_sender.clone();

        let shutdown = CancellationToken::new();
        let shutdown_task = shutdown.clone();

        let failing_writes = self.failing_writes;

        let handle = tokio::spawn(
            async move {
                let publish = |event: EndpointEvent| match broadcast_sender_task.send(event) {
                    Ok(listeners) => trace!("Broadcasted to {listeners} listener(s)"),
                    Err(e) => trace!("Nobody listening: {e:?}"),
                };

                loop {
                    let event = tokio::select! {
                        event = events.next() => event,
                        _ = shutdown_task.cancelled() => None,
                    };

                    match event {
                        Some(Event::PleasePutThisOnWire(WriteRequest { message, reply })) => {
                            trace!(message = %SerialMessage::new_lossy(&message), "Mock write");

                            let result = if failing_writes {
                                Err(Error::Io("mock refuses writes".into()))
                            } else {
                                publish(EndpointEvent::ToWire(message.clone()));
                                publish(EndpointEvent::FromWire(message));
                                Ok(())
                            };

                            let _ = reply.send(result);
                        }
                        Some(Event::DeviceSaid(message)) => {
                            publish(EndpointEvent::FromWire(message));
                        }
                        None => {
                            info!("Mock stopping");
                            break;
                        }
                    }
                }

                publish(EndpointEvent::Closed);
            }
            .instrument(info_span!("mock", name = %self.name)),
        );

        MockHandle {
            name: self.name,
            handle,
            should_put_on_wire_sender,
            injection_sender,
            broadcast_sender,
            shutdown,
        }
    }
}

pub(crate) struct MockHandle {
    pub(crate) name: String,

    pub(crate) handle: JoinHandle<()>,

    // Used for giving out senders (via clone)
    pub(crate) should_put_on_wire_sender: mpsc::Sender<WriteRequest>,

    // Makes the mock device speak on its own
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) injection_sender: mpsc::UnboundedSender<SerialMessageBytes>,

    // Used for giving out receivers (via subscribe)
    pub(crate) broadcast_sender: broadcast::Sender<EndpointEvent>,

    pub(crate) shutdown: CancellationToken,
}

impl MockHandle {
    /// Messages sent here appear as if the device sent them unprompted.
    #[cfg(test)]
    pub(crate) fn injector(&self) -> mpsc::UnboundedSender<SerialMessageBytes> {
        self.injection_sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::SinkExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::endpoint::Endpoint;

    async fn write(mock: &MockHandle, message: &'static str) -> Result<(), Error> {
        let (request, outcome) = WriteRequest::new(Bytes::from_static(message.as_bytes()));
        mock.message_sender().send(request).await.unwrap();

        outcome.await.unwrap()
    }

    #[tokio::test]
    async fn loopback() {
        let mock = MockBuilder::new("loopback").build();
        let mut rx = mock.events();

        write(&mock, "Hi").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::ToWire("Hi".into()));
        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::FromWire("Hi".into()));
    }

    #[tokio::test]
    async fn loopback_rx_created_late() {
        let mock = MockBuilder::new("late").build();

        write(&mock, "Hi").await.unwrap();

        // Gaurantee it has been sent
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut rx = mock.events();

        // The broadcast only gets things sent after subscribing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn list_of_messages_keeps_order() {
        let mock = MockBuilder::new("list").build();
        let mut rx = mock.events();

        let messages = ["one", "two", "three"];

        for msg in messages {
            write(&mock, msg).await.unwrap();
        }

        for msg in messages {
            assert_eq!(rx.recv().await.unwrap().as_to_wire().unwrap(), msg.as_bytes());
            assert_eq!(rx.recv().await.unwrap().as_from_wire().unwrap(), msg.as_bytes());
        }
    }

    #[tokio::test]
    async fn injected_messages_come_from_wire() {
        let mock = MockBuilder::new("injected").build();
        let mut rx = mock.events();

        mock.injector().send("ack".into()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::FromWire("ack".into()));
    }

    #[tokio::test]
    async fn failing_writes_are_reported() {
        let mock = MockBuilder::new("failing").failing_writes().build();
        let mut rx = mock.events();

        let result = write(&mock, "Hi").await;

        assert!(matches!(result, Err(Error::Io(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_publishes_closed() {
        let mock = MockBuilder::new("closing").build();
        let mut rx = mock.events();

        Box::new(mock).close().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), EndpointEvent::Closed);
    }
}
