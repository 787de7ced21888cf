//! Byte transports the dispatcher sends through
//!
//! Wire framing is the transport's concern; the pipeline hands each transport
//! an already-encoded packet and only cares whether the send succeeded.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

/// Sends datagrams to one client through the server's shared socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr) -> Self {
        Self { socket, addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, self.addr).await?;
        Ok(())
    }

    fn peer(&self) -> String {
        self.addr.to_string()
    }
}

/// In-process transport backed by a bounded channel.
///
/// A full channel makes `send` wait, so a reader that stops draining behaves
/// like a slow client; dropping the reader behaves like a dead one.
pub struct ChannelTransport {
    sender: mpsc::Sender<Vec<u8>>,
    label: String,
}

impl ChannelTransport {
    pub fn new(label: &str, capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                label: label.to_string(),
            },
            receiver,
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sender
            .send(bytes.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn peer(&self) -> String {
        format!("channel:{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Packet;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::new("a", 4);
        transport.send(b"hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(transport.peer(), "channel:a");
    }

    #[tokio::test]
    async fn test_channel_transport_closed() {
        let (transport, rx) = ChannelTransport::new("gone", 4);
        drop(rx);
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_udp_transport_sends_datagram() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(Arc::clone(&server), client.local_addr().unwrap());

        let packet = Packet::Disconnected {
            reason: "test".to_string(),
        };
        transport.send(&packet.encode().unwrap()).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, server.local_addr().unwrap());
        assert_eq!(Packet::decode(&buf[..len]).unwrap(), packet);
        assert_eq!(transport.peer(), transport.addr().to_string());
    }
}
