use std::io;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use crossfire::{mpmc, mpsc, AsyncRx, MAsyncRx, MAsyncTx, MTx, TrySendError};
use futures::future::BoxFuture;
use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

use crate::error::RpcError;

/// Length prefix: 4 bytes big-endian, payload up to u32::MAX.
pub const LEN_MSG_LEN: usize = 4;

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Invoked with every established connection; the returned future is the
/// connection's lifetime.
pub type ConnHandler = Arc<dyn Fn(TcpStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared write contract over one framed connection. Reads stay with the
/// owning task via [FrameReader]. Cheap to clone.
#[derive(Clone)]
pub struct Conn(Arc<ConnInner>);

struct ConnInner {
    write_tx: MAsyncTx<Vec<u8>>,
    close_tx: Mutex<Option<MTx<()>>>,
    close_rx: MAsyncRx<()>,
    local_addr: String,
    peer_addr: String,
}

impl Conn {
    /// Take over the write half; spawns the write pump.
    pub fn start(
        wr: OwnedWriteHalf, pending_write_num: usize, local_addr: String, peer_addr: String,
    ) -> Conn {
        let (write_tx, write_rx) = mpsc::bounded_async::<Vec<u8>>(pending_write_num.max(1));
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        let conn = Conn(Arc::new(ConnInner {
            write_tx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            local_addr,
            peer_addr,
        }));
        tokio::spawn(write_pump(wr, write_rx, conn.clone()));
        conn
    }

    /// Queue one message for the peer; blocks while the write queue is full.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), RpcError> {
        self.0.write_tx.send(data).await.map_err(|_| RpcError::Transport)
    }

    /// Queue from a non-async context; a full queue falls back to a send
    /// task so the frame is not lost.
    pub fn send_background(&self, data: Vec<u8>) {
        match self.0.write_tx.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => {
                let conn = self.clone();
                tokio::spawn(async move {
                    let _ = conn.send(data).await;
                });
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("conn {}: send on closed connection", self.0.peer_addr);
            }
        }
    }

    /// Force-close: unblocks the read loop and stops the write pump.
    /// Idempotent.
    pub fn destroy(&self) {
        self.0.close_tx.lock().unwrap().take();
    }

    /// Receiver that errors out once the connection is destroyed.
    pub(crate) fn close_rx(&self) -> MAsyncRx<()> {
        self.0.close_rx.clone()
    }

    pub fn local_addr(&self) -> &str {
        &self.0.local_addr
    }

    pub fn peer_addr(&self) -> &str {
        &self.0.peer_addr
    }
}

async fn write_pump(mut wr: OwnedWriteHalf, write_rx: AsyncRx<Vec<u8>>, conn: Conn) {
    let close_rx = conn.close_rx();
    let mut buf = BytesMut::with_capacity(512);
    loop {
        let data = tokio::select! {
            r = write_rx.recv() => match r {
                Ok(data) => data,
                Err(_) => break,
            },
            _ = close_rx.recv() => break,
        };
        buf.clear();
        buf.reserve(LEN_MSG_LEN + data.len());
        buf.put_u32(data.len() as u32);
        buf.put_slice(&data);
        if let Err(e) = wr.write_all(&buf).await {
            debug!("conn {}: write: {:?}", conn.peer_addr(), e);
            break;
        }
    }
    let _ = wr.shutdown().await;
    conn.destroy();
}

/// Read half of a framed connection, owned by the connection's read task.
pub struct FrameReader {
    rd: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(rd: OwnedReadHalf) -> FrameReader {
        FrameReader { rd, buf: BytesMut::with_capacity(512) }
    }

    /// Next frame payload. The slice is valid until the next call.
    pub async fn read_frame(&mut self) -> io::Result<&[u8]> {
        let mut head = [0u8; LEN_MSG_LEN];
        self.rd.read_exact(&mut head).await?;
        let len = u32::from_be_bytes(head) as usize;
        self.buf.resize(len, 0);
        self.rd.read_exact(&mut self.buf[..]).await?;
        Ok(&self.buf)
    }
}

/// Accepting side of the mesh; one spawned handler future per connection.
pub struct TcpServer {
    close_tx: Mutex<Option<MTx<()>>>,
    local_addr: String,
}

impl TcpServer {
    pub async fn start(addr: &str, handler: ConnHandler) -> io::Result<TcpServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        tokio::spawn(accept_loop(listener, handler, close_rx));
        info!("listening on {}", local_addr);
        Ok(TcpServer { close_tx: Mutex::new(Some(close_tx)), local_addr })
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn close(&self) {
        self.close_tx.lock().unwrap().take();
    }
}

async fn accept_loop(listener: TcpListener, handler: ConnHandler, close_rx: MAsyncRx<()>) {
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, addr)) => {
                    trace!("accepted {}", addr);
                    tokio::spawn(handler(stream));
                }
                Err(e) => {
                    warn!("accept: {:?}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            },
            _ = close_rx.recv() => break,
        }
    }
}

/// Dialing side: keeps one connection to `addr` alive, reconnecting every
/// [RECONNECT_INTERVAL] until closed.
pub struct TcpClient {
    close_tx: Mutex<Option<MTx<()>>>,
}

impl TcpClient {
    pub fn start(addr: String, handler: ConnHandler) -> TcpClient {
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        tokio::spawn(dial_loop(addr, handler, close_rx));
        TcpClient { close_tx: Mutex::new(Some(close_tx)) }
    }

    pub fn close(&self) {
        self.close_tx.lock().unwrap().take();
    }
}

async fn dial_loop(addr: String, handler: ConnHandler, close_rx: MAsyncRx<()>) {
    loop {
        let connect = tokio::select! {
            r = TcpStream::connect(&addr) => Some(r),
            _ = close_rx.recv() => None,
        };
        match connect {
            None => return,
            Some(Ok(stream)) => handler(stream).await,
            Some(Err(e)) => debug!("connect {}: {:?}", addr, e),
        }
        tokio::select! {
            _ = sleep(RECONNECT_INTERVAL) => {}
            _ = close_rx.recv() => return,
        }
    }
}
