//! A serial port endpoint.

use futures::channel::mpsc;
use tokio::{sync::broadcast, task::JoinHandle};

use super::{Endpoint, EndpointEvent, EndpointId, WriteRequest};
use crate::serial::serial_port::SerialPortHandle;

impl Endpoint for SerialPortHandle {
    fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.broadcast_tx.subscribe()
    }

    fn message_sender(&self) -> mpsc::Sender<WriteRequest> {
        self.serial_tx.clone()
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::Tty(self.tty.clone())
    }

    fn close(self: Box<Self>) -> JoinHandle<()> {
        self.shutdown.cancel();
        self.handle
    }
}
