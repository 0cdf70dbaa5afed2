//! TCP device server.
//!
//! Accepts master connections one at a time.  For each connection the root
//! device is opened on a fresh [`HostPort`]; when the master disconnects the
//! port is closed, which detaches the root device so the next master can
//! attach.  Clearing the `running` flag ends the current session as well as
//! the accept loop.
//!
//! The same plumbing carries remote devices: [`run_device_acceptor`] plugs a
//! [`RemoteDevice`] into a bus for every incoming device connection, and
//! [`attach_remote`] connects a local device out to such an acceptor.
//!
//! # Write path (for beginners)
//!
//! Replies are produced synchronously by devices but a socket write is
//! asynchronous.  The [`ChannelTransport`] bridges the two: it pushes encoded
//! frames into an unbounded `mpsc` channel, and a single writer task drains
//! the channel into the socket in order.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use tbus_core::{Transport, TransportError};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::device::Device;
use crate::error::BusError;
use crate::host::HostPort;
use crate::remote::RemoteDevice;

/// How long `accept` or `read` waits before the shutdown flag is checked again.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

const READ_BUF_SIZE: usize = 4096;

/// Errors ending a single master session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The root device could not be attached to the new connection.
    #[error("cannot serve root device: {0}")]
    Bus(#[from] BusError),
}

/// Transport that queues frames for a writer task.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(bytes).map_err(|_| TransportError::Closed)
    }
}

/// Accepts masters on `listener` until `running` is cleared.
pub async fn run_server(
    listener: TcpListener,
    root: Arc<Device>,
    running: Arc<AtomicBool>,
) -> std::io::Result<()> {
    info!("device host listening on {}", listener.local_addr()?);

    while running.load(Ordering::Relaxed) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!("master connected from {peer}");
                match serve_connection(stream, Arc::clone(&root), &running).await {
                    Ok(()) => info!("master {peer} disconnected"),
                    Err(e) => warn!("session with {peer} ended: {e}"),
                }
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }

    info!("shutdown flag set; device host stopped");
    Ok(())
}

/// Serves one master until it disconnects or `running` is cleared.
pub async fn serve_connection(
    stream: TcpStream,
    root: Arc<Device>,
    running: &AtomicBool,
) -> Result<(), SessionError> {
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let host = match HostPort::open(root, Arc::new(ChannelTransport::new(tx))) {
        Ok(host) => host,
        Err(e) => {
            writer_task.abort();
            return Err(e.into());
        }
    };
    let result = read_loop(&mut reader, running, peer, |chunk| host.receive(chunk)).await;

    host.close();
    writer_task.abort();
    result
}

/// Accepts remote devices on `listener` and plugs each into `bus`.
///
/// Unlike masters, any number of devices can be connected at once.  Runs
/// until `running` is cleared.
pub async fn run_device_acceptor(
    listener: TcpListener,
    bus: Arc<Bus>,
    running: Arc<AtomicBool>,
) -> std::io::Result<()> {
    info!("accepting remote devices on {}", listener.local_addr()?);

    while running.load(Ordering::Relaxed) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!("remote device connected from {peer}");
                let bus = Arc::clone(&bus);
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    match serve_remote_device(stream, bus, &running).await {
                        Ok(()) => info!("remote device {peer} disconnected"),
                        Err(e) => warn!("remote device {peer} dropped: {e}"),
                    }
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }

    info!("shutdown flag set; remote device acceptor stopped");
    Ok(())
}

/// Stands in for one remote device on `bus` until its connection ends.
pub async fn serve_remote_device(
    stream: TcpStream,
    bus: Arc<Bus>,
    running: &AtomicBool,
) -> Result<(), SessionError> {
    stream.set_nodelay(true)?;
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let remote = RemoteDevice::new(bus, Arc::new(ChannelTransport::new(tx)));
    let result = read_loop(&mut reader, running, peer, |chunk| remote.receive(chunk)).await;

    remote.close();
    writer_task.abort();
    result
}

/// Connects `device` to the remote bus at `addr` and serves it there.
///
/// Returns when the bus host hangs up or `running` is cleared.
pub async fn attach_remote(
    addr: &str,
    device: Arc<Device>,
    running: &AtomicBool,
) -> Result<(), SessionError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let host = match HostPort::announce(device, Arc::new(ChannelTransport::new(tx))) {
        Ok(host) => host,
        Err(e) => {
            writer_task.abort();
            return Err(e.into());
        }
    };
    info!("announced device to remote bus at {addr}");
    let result = read_loop(&mut reader, running, peer, |chunk| host.receive(chunk)).await;

    host.close();
    writer_task.abort();
    result
}

/// Feeds everything read from `reader` to `sink` until EOF or shutdown.
async fn read_loop(
    reader: &mut OwnedReadHalf,
    running: &AtomicBool,
    peer: Option<SocketAddr>,
    sink: impl Fn(&[u8]),
) -> Result<(), SessionError> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = shutdown(running) => {
                info!(?peer, "shutting down; closing session");
                return Ok(());
            }
        };
        match read {
            Ok(0) => return Ok(()),
            Ok(n) => {
                debug!(?peer, bytes = n, "received");
                sink(&buf[..n]);
            }
            Err(e) => return Err(SessionError::Io(e)),
        }
    }
}

/// Resolves once `running` has been cleared.
async fn shutdown(running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(ACCEPT_POLL).await;
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("write to master failed: {e}");
            break;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ChannelTransport::new(tx);
        drop(rx);

        let result = link.write(vec![1]).await;

        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_run_server_returns_when_flag_is_cleared() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let root = crate::device::DeviceBuilder::new(1, 1).build(Arc::new(()));
        let running = Arc::new(AtomicBool::new(false));

        // Act / Assert – exits on the first check
        run_server(listener, root, running).await.unwrap();
    }

    #[tokio::test]
    async fn test_clearing_the_flag_ends_a_connected_session() {
        // Arrange – a master connects and then stays silent
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let root = crate::device::DeviceBuilder::new(1, 1).build(Arc::new(()));
        let running = Arc::new(AtomicBool::new(true));
        let server = tokio::spawn(run_server(listener, Arc::clone(&root), Arc::clone(&running)));
        let mut client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if root.is_attached() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(root.is_attached(), "session was opened");

        // Act
        running.store(false, Ordering::Relaxed);

        // Assert – the server stops and the session's port was closed
        timeout(Duration::from_secs(2), server)
            .await
            .expect("server stops while the master is still connected")
            .unwrap()
            .unwrap();
        assert!(!root.is_attached());
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
        assert_eq!(read.unwrap(), 0, "connection was closed");
    }
}
