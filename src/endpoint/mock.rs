//! A mock endpoint.
//! Messages to put on the wire are sent back as if the device answered with them.
//!
//! Useful for testing the relay without a serial port- faster and more reliable.

use futures::channel::mpsc;
use tokio::{sync::broadcast, task::JoinHandle};

use super::{Endpoint, EndpointEvent, EndpointId, WriteRequest};
use crate::mock::MockHandle;

impl Endpoint for MockHandle {
    fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.broadcast_sender.subscribe()
    }

    fn message_sender(&self) -> mpsc::Sender<WriteRequest> {
        self.should_put_on_wire_sender.clone()
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::Mock(self.name.clone())
    }

    fn close(self: Box<Self>) -> JoinHandle<()> {
        self.shutdown.cancel();
        self.handle
    }
}
