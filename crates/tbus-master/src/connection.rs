//! TCP link from the master to a device host.
//!
//! Architecture:
//! - `TcpLink` owns the write half of the stream and implements [`Transport`].
//! - A reader task pushes every received chunk into [`Master::receive`].
//! - When the stream ends the reader tells the master, which resolves all
//!   pending invocations with `Disconnected`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tbus_core::{Transport, TransportError};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::master::Master;

const READ_BUF_SIZE: usize = 4096;

/// Errors that can occur while establishing a link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to device host at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The write side of a master's TCP connection.
pub struct TcpLink {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpLink {
    /// Connects to `addr`, attaches the link to `master` and starts reading.
    pub async fn connect(addr: &str, master: &Arc<Master>) -> Result<Arc<Self>, LinkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| LinkError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        Self::attach(stream, master)
    }

    /// Attaches an already connected stream to `master`.
    pub fn attach(stream: TcpStream, master: &Arc<Master>) -> Result<Arc<Self>, LinkError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let link = Arc::new(Self {
            peer,
            writer: Mutex::new(writer),
        });
        let epoch = master.connect(Arc::clone(&link) as Arc<dyn Transport>);
        tokio::spawn(read_loop(reader, Arc::clone(master), epoch, peer));

        info!("connected to device host at {peer}");
        Ok(link)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpLink {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }
}

async fn read_loop(mut reader: OwnedReadHalf, master: Arc<Master>, epoch: u64, peer: SocketAddr) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("device host {peer} closed the connection");
                break;
            }
            Ok(n) => {
                debug!(bytes = n, "received");
                master.receive(&buf[..n]);
            }
            Err(e) => {
                warn!("read from device host {peer} failed: {e}");
                break;
            }
        }
    }
    master.link_closed(epoch);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvokeError;
    use tbus_core::RoutePath;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_with_address() {
        // Bind then drop to find a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpLink::connect(&addr, &Master::new()).await;

        match result {
            Err(LinkError::ConnectFailed { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_flushes_pending_invocations() {
        // Arrange – a "host" that accepts, reads one request, then hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        });
        let master = Master::new();
        let link = TcpLink::connect(&addr, &master).await.unwrap();

        // Act
        let result = master.invoke(1, Vec::new(), &RoutePath::local()).await;

        // Assert
        assert!(matches!(result, Err(InvokeError::Disconnected)));
        assert!(!master.is_connected());
        assert_eq!(link.peer().to_string(), addr);
    }
}
