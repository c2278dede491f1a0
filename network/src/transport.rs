// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-stream transports for replication sessions

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Source of duplex streams to and from other processes
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a stream to `addr`
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Self::Stream>>;

    /// Wait for the next inbound stream. Cancel safe.
    fn accept(&self) -> BoxFuture<'_, io::Result<(Self::Stream, SocketAddr)>>;

    /// Address other processes dial to reach us
    fn local_addr(&self) -> SocketAddr;
}

/// Plain TCP
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Replication listener bound to {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>> {
        Box::pin(async move {
            let (stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((stream, addr))
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Buffer size of each in-memory pipe direction
const MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

type Incoming = mpsc::Sender<(DuplexStream, SocketAddr)>;

/// In-process network handing out `MemoryTransport`s at fake addresses
#[derive(Clone)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<SocketAddr, Incoming>>>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            listeners: Arc::default(),
            next_port: Arc::new(AtomicU16::new(10_000)),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Listen at a fresh address
    pub fn bind(&self) -> MemoryTransport {
        let addr = self.allocate();
        let (tx, rx) = mpsc::channel(16);
        self.listeners.lock().insert(addr, tx);
        MemoryTransport {
            network: self.clone(),
            local_addr: addr,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Open a pipe to whoever listens at `addr`
    pub fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<DuplexStream>> {
        let listener = self.listeners.lock().get(&addr).cloned();
        let source = self.allocate();
        Box::pin(async move {
            let listener = listener.ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening at {addr}"))
            })?;
            let (ours, theirs) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
            listener.send((theirs, source)).await.map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("listener at {addr} closed"))
            })?;
            Ok(ours)
        })
    }
}

/// One listening endpoint on a `MemoryNetwork`
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(DuplexStream, SocketAddr)>>,
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;

    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<DuplexStream>> {
        self.network.connect(addr)
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(DuplexStream, SocketAddr)>> {
        Box::pin(async move {
            let mut incoming = self.incoming.lock().await;
            incoming.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "memory listener closed")
            })
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.listeners.lock().remove(&self.local_addr);
    }
}
