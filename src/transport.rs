//! UDP transport binding.
//!
//! Owns the node's UDP endpoint: overlay messages go out as single datagrams
//! and inbound datagrams are dispatched to the engine through the
//! `DatagramHandler` seam.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{error, trace, warn};

use crate::error::Result;
use crate::proto::OverlayMessage;

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM: usize = 4096;

/// Receiver side of the transport: one call per inbound datagram.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr);
}

/// The node's UDP endpoint.
pub struct UdpTransport {
    socket: UdpSocket,
    local_port: u16,
}

impl UdpTransport {
    /// Bind `0.0.0.0:port`; port 0 lets the OS choose.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_port = socket.local_addr()?.port();
        Ok(UdpTransport { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Serialize and transmit one overlay message as a single datagram.
    pub async fn send(&self, msg: &OverlayMessage, dest: SocketAddr) -> Result<usize> {
        let bytes = msg.to_bytes();
        let n = self.socket.send_to(&bytes, dest).await?;
        trace!("sent {} bytes to {}", n, dest);
        Ok(n)
    }

    /// Read datagrams forever, handing each to the handler. Returns only on
    /// an unrecoverable socket error.
    pub async fn receive_loop(self: Arc<Self>, handler: Arc<dyn DatagramHandler>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, src)) => handler.handle_datagram(&buf[..n], src).await,
                // ICMP-driven errors surface here on Linux; keep reading.
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    warn!("transient receive error: {}", e);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("UDP receive loop terminated: {}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MsgType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Capture(mpsc::Sender<(Vec<u8>, SocketAddr)>);

    #[async_trait]
    impl DatagramHandler for Capture {
        async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
            let _ = self.0.send((data.to_vec(), src)).await;
        }
    }

    #[tokio::test]
    async fn bind_reports_os_assigned_port() {
        let transport = UdpTransport::bind(0).await.unwrap();
        assert_ne!(transport.local_port(), 0);
    }

    #[tokio::test]
    async fn messages_cross_the_loopback() {
        let receiver = Arc::new(UdpTransport::bind(0).await.unwrap());
        let sender = UdpTransport::bind(0).await.unwrap();
        let dest: SocketAddr = format!("127.0.0.1:{}", receiver.local_port())
            .parse()
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(Arc::clone(&receiver).receive_loop(Arc::new(Capture(tx))));

        let msg = OverlayMessage::intro("10.0.0.1,06:aa:aa:aa:aa:aa");
        sender.send(&msg, dest).await.unwrap();

        let (data, src) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src.port(), sender.local_port());
        let parsed = OverlayMessage::from_bytes(&data).unwrap();
        assert_eq!(parsed.msg_type(), Some(MsgType::Intro));
        assert_eq!(parsed, msg);
    }
}
