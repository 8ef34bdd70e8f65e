use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use bytes::Bytes;
use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    connection::{Connection, ConnectionId, Outgoing},
    relay::{RelayHandle, RelayMessage},
    serial::SerialMessage,
};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<RelayHandle>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("Client", %addr);

        handle_websocket(socket, addr, relay).instrument(span)
    })
}

fn outgoing_frame(data: Bytes) -> Message {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

pub(crate) async fn read<S>(mut receiver: S, id: ConnectionId, relay: RelayHandle)
where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    while let Some(msg) = receiver.next().await {
        let message = match msg {
            Ok(Message::Text(text)) => Bytes::from(text),
            Ok(Message::Binary(binary)) => Bytes::from(binary),
            Ok(Message::Ping(_)) => {
                debug!("socket ping");
                continue;
            }
            Ok(Message::Pong(_)) => {
                debug!("socket pong");
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                relay.inform(RelayMessage::Errored {
                    id,
                    error: e.to_string(),
                });
                break;
            }
        };

        trace!(message = %SerialMessage::new_lossy(&message), "client message");
        relay.inform(RelayMessage::Message { from: id, message });
    }

    debug!("no more stuff");
}

pub(crate) async fn write(
    mut sender: impl Sink<Message> + Unpin,
    mut receiver: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = receiver.recv().await {
        let frame = match outgoing {
            Outgoing::Message(data) => outgoing_frame(data),
            Outgoing::Close => {
                debug!("Closing client");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };

        if sender.send(frame).await.is_err() {
            debug!("client disconnected");
            return;
        }
        trace!("Message flushed");
    }
}

pub(crate) async fn handle_websocket(websocket: WebSocket, addr: SocketAddr, relay: RelayHandle) {
    let (stream_sender, stream_receiver) = websocket.split();

    let (connection, outbox) = Connection::new(addr);
    let id = connection.id();

    let span = info_span!("Connection", %id);

    relay.inform(RelayMessage::Opened(connection));

    let mut read_handle = tokio::spawn(
        read(stream_receiver, id, relay.clone()).instrument(info_span!(parent: &span, "Read")),
    );
    let mut write_handle = tokio::spawn(
        write(stream_sender, outbox).instrument(info_span!(parent: &span, "Write")),
    );
    drop(span);

    // Either half ending ends the session.
    tokio::select! {
        joined = &mut read_handle => {
            if let Err(e) = joined {
                warn!("Read task join error: {e:?}");
            }
            debug!("Aborting write task");
            write_handle.abort();
        }
        joined = &mut write_handle => {
            if let Err(e) = joined {
                warn!("Write task join error: {e:?}");
            }
            debug!("Aborting read task");
            read_handle.abort();
        }
    }

    relay.inform(RelayMessage::Closed(id));
}
