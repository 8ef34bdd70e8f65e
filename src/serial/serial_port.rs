use std::time::Duration;

use futures::{channel::mpsc, StreamExt};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, trace, warn, Instrument};

use crate::{
    config::SerialConfig,
    endpoint::{EndpointEvent, WriteRequest, WRITE_QUEUE_DEPTH},
    error::Error,
    serial::{channel::SerialChannel, line_config::LineConfig, SerialMessage},
};

/// Builder for a [`SerialPortHandle`].
#[derive(Debug)]
pub(crate) struct SerialPortBuilder {
    config: LineConfig,
    settle_delay: Option<Duration>,
    read_chunk_size: Option<usize>,
    read_timeout: Option<Duration>,
}

impl SerialPortBuilder {
    /// Start a new builder.
    pub(crate) fn new(config: LineConfig) -> Self {
        Self {
            config,
            settle_delay: None,
            read_chunk_size: None,
            read_timeout: None,
        }
    }

    /// Take write and read timing from the serial section of the config.
    pub(crate) fn with_timing(mut self, serial: &SerialConfig) -> Self {
        self.settle_delay = Some(serial.settle_delay());
        self.read_chunk_size = Some(serial.read_chunk_size);
        self.read_timeout = Some(serial.read_timeout());
        self
    }

    /// Open the line and start the task driving it.
    ///
    /// Fails right away if the line cannot be set up or opened.
    pub(crate) async fn build(self) -> Result<SerialPortHandle, Error> {
        let settle_delay = self.settle_delay.unwrap_or(Duration::from_millis(100));
        let read_chunk_size = self.read_chunk_size.unwrap_or(128);
        let read_timeout = self.read_timeout.unwrap_or(Duration::from_millis(100));

        let tty = self.config.port().to_string();
        info!(%tty, config = %self.config, "Starting serial port handler");

        let mut channel = SerialChannel::new(self.config).await?;
        channel.open().await?;

        let (should_put_on_wire_sender, mut should_put_on_wire_receiver) =
            mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);

        // Outsiders will be getting observing messages from this broadcast.
        let (broadcast_sender, _) = broadcast::channel(1024);
        let broadcast_sender_task = broadcast_sender.clone();

        let shutdown = CancellationToken::new();
        let shutdown_task = shutdown.clone();

        let tty_span = info_span!("tty", %tty);

        let handle = tokio::spawn(
            async move {
                let publish = |event: EndpointEvent| match broadcast_sender_task.send(event) {
                    Ok(listeners) => trace!("Broadcasted to {listeners} listener(s)"),
                    Err(e) => trace!("Nobody listening: {e:?}"),
                };

                loop {
                    tokio::select! {
                        request = should_put_on_wire_receiver.next() => {
                            let Some(WriteRequest { message, reply }) = request else {
                                info!("No more writers, exiting");
                                break;
                            };

                            let result = channel.write(&message, settle_delay).await;

                            match &result {
                                Ok(()) => publish(EndpointEvent::ToWire(message)),
                                Err(e) => warn!(?e, "Serial port error in send"),
                            }

                            if reply.send(result).is_err() {
                                trace!("Writer left before the write finished");
                            }
                        }
                        readiness = channel.readable() => {
                            if let Err(e) = readiness {
                                error!(?e, "Serial port readiness error, exiting");
                                break;
                            }

                            match channel.read(read_chunk_size, read_timeout).await {
                                Ok(message) if message.is_empty() => {}
                                Ok(message) => {
                                    trace!(message = %SerialMessage::new_lossy(&message), "Message from port");
                                    publish(EndpointEvent::FromWire(message));
                                }
                                Err(e) => {
                                    error!(?e, "Serial port error, exiting");
                                    break;
                                }
                            }
                        }
                        _ = shutdown_task.cancelled() => {
                            info!("Shutting down");
                            break;
                        }
                    }
                }

                if let Err(e) = channel.close() {
                    warn!(?e, "Could not close line");
                }

                publish(EndpointEvent::Closed);
            }
            .instrument(tty_span),
        );

        Ok(SerialPortHandle {
            tty,
            handle,
            serial_tx: should_put_on_wire_sender,
            broadcast_tx: broadcast_sender,
            shutdown,
        })
    }
}

pub(crate) struct SerialPortHandle {
    pub(crate) tty: String,
    pub(crate) handle: JoinHandle<()>,
    pub(crate) serial_tx: mpsc::Sender<WriteRequest>,
    pub(crate) broadcast_tx: broadcast::Sender<EndpointEvent>,
    pub(crate) shutdown: CancellationToken,
}
