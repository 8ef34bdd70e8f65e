#![allow(dead_code)]

use std::{os::unix::io::RawFd, time::Duration};

use axum::http::StatusCode;
use color_eyre::{eyre::eyre, Result};
use futures::{SinkExt, StreamExt};
use serial_relay::config::Config;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;
use tungstenite::Message;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn mock_config(name: &str) -> Config {
    Config {
        mock: Some(name.into()),
        ..Default::default()
    }
}

pub async fn start_server_with_config(config: Config) -> u16 {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move { serial_relay::server::run_any_port(config, port_tx).await });
    port_rx
        .await
        .expect("Server should reply with allocated port")
}

pub async fn start_mock_server(name: &str) -> u16 {
    start_server_with_config(mock_config(name)).await
}

pub async fn connect(port: u16) -> Result<Client> {
    info!("Connecting to server on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

/// Give the relay a moment to attach freshly connected clients.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub async fn send_text(client: &mut Client, text: &str) -> Result<()> {
    client.send(Message::Text(text.into())).await?;

    Ok(())
}

pub async fn receive(client: &mut Client) -> Result<Message> {
    let message = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| eyre!("Stream closed"))??;

    Ok(message)
}

pub async fn receive_text(client: &mut Client) -> Result<String> {
    match receive(client).await? {
        Message::Text(text) => Ok(text),
        other => Err(eyre!("Expected text, got {other:?}")),
    }
}

/// Check that nothing arrives for a little while.
pub async fn assert_silent(client: &mut Client) {
    let next = timeout(Duration::from_millis(300), client.next()).await;

    assert!(next.is_err(), "Expected silence, got {next:?}");
}

/// Plain HTTP GET, returning the body.
pub async fn get(port: u16, path: &str) -> Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    stream
        .write_all(format!("GET {path} HTTP/1.0\r\nHost: 127.0.0.1\r\n\r\n").as_bytes())
        .await?;

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response)).await??;

    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| eyre!("Malformed response: {response}"))?;

    if !head.starts_with("HTTP/1.0 200") && !head.starts_with("HTTP/1.1 200") {
        return Err(eyre!("Unexpected response: {head}"));
    }

    Ok(body.to_string())
}

/// A pseudo terminal standing in for a serial device.
/// The relay opens `path`, the test plays the device through `master`.
pub struct Pty {
    pub master: RawFd,
    pub path: String,

    // Keeps the device around even while the relay has it closed.
    slave: RawFd,
}

pub fn pty() -> Result<Pty> {
    let ends = nix::pty::openpty(None, None)?;

    let path = nix::unistd::ttyname(ends.slave)?
        .to_string_lossy()
        .to_string();

    Ok(Pty {
        master: ends.master,
        path,
        slave: ends.slave,
    })
}

impl Pty {
    /// Read exactly `len` bytes of what was written to the device.
    pub async fn device_received(&self, len: usize) -> Result<Vec<u8>> {
        let master = nix::unistd::dup(self.master)?;

        let read = tokio::task::spawn_blocking(move || -> nix::Result<Vec<u8>> {
            let mut buffer = vec![0; len];
            let mut filled = 0;

            let outcome = loop {
                if filled == len {
                    break Ok(());
                }
                match nix::unistd::read(master, &mut buffer[filled..]) {
                    Ok(0) => break Err(nix::errno::Errno::EIO),
                    Ok(n) => filled += n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => break Err(e),
                }
            };

            nix::unistd::close(master)?;
            outcome.map(|()| buffer)
        });

        Ok(timeout(Duration::from_secs(5), read).await???)
    }

    /// Make the device say something.
    pub fn device_says(&self, message: &[u8]) -> Result<()> {
        let mut written = 0;

        while written < message.len() {
            written += nix::unistd::write(self.master, &message[written..])?;
        }

        Ok(())
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.master);
        let _ = nix::unistd::close(self.slave);
    }
}
