//! One-peer TCP endpoint: accept or connect, non-blocking-style send with
//! partial-write retry, framed receive, and lock-free close.
//!
//! The active socket is held in an [`arc_swap::ArcSwapOption`] so that
//! `close()` can atomically swap it to `None` without taking a lock that a
//! concurrent `recv`/`send` might be blocked on — this is the "single-owner
//! close" guarantee spec.md §4.3/§5 requires.

use crate::error::{EndpointError, Result};
use crate::protocol::{self, Frame, MsgType};
use arc_swap::ArcSwapOption;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

pub const SEND_BUDGET: Duration = Duration::from_millis(20);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SOCKET_BUF_BYTES: usize = 32 * 1024;

/// The single active TCP counterparty of this endpoint. `CallEngine` is the
/// source of truth for call/connection state (`CallState`, `ConnState`,
/// `last_ping`); this struct only owns the socket handle and the address it
/// was accepted/connected from.
pub struct PeerSession {
    socket: ArcSwapOption<AsyncMutex<TcpStream>>,
    pub peer_addr: SocketAddr,
}

impl PeerSession {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            socket: ArcSwapOption::from_pointee(AsyncMutex::new(stream)),
            peer_addr,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.socket.load().is_none()
    }
}

/// Owns the listening socket and tracks the exactly-zero-or-one active
/// `PeerSession`.
pub struct PeerLink {
    listener: Option<TcpListener>,
    active: std::sync::Mutex<Option<Arc<PeerSession>>>,
    send_mutex: Arc<AsyncMutex<()>>,
}

impl PeerLink {
    pub fn new() -> Self {
        Self {
            listener: None,
            active: std::sync::Mutex::new(None),
            send_mutex: Arc::new(AsyncMutex::new(())),
        }
    }

    pub async fn listen(&mut self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        debug!("listening on port {port}");
        self.listener = Some(listener);
        Ok(())
    }

    /// Returns `Ok(None)` if no inbound connection is pending, `Ok(Some(_))`
    /// on a new peer, and rejects with [`EndpointError::Busy`] if a session
    /// is already active (caller is expected to reply `ERROR{BUSY}` and close
    /// the rejected socket per the accept policy in spec.md §4.5).
    pub async fn try_accept(&self) -> Result<Option<Arc<PeerSession>>> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| EndpointError::ProtocolViolation("not listening".into()))?;

        let (stream, addr) = match listener.accept().now_or_never() {
            Some(res) => res?,
            None => return Ok(None),
        };

        if self.active.lock().unwrap().is_some() {
            let mut stream = stream;
            let _ = stream
                .write_all(&protocol::encode(
                    MsgType::Error.to_byte(),
                    0,
                    &[crate::protocol::ErrorReason::Busy as u8],
                )?)
                .await;
            let _ = stream.shutdown().await;
            return Err(EndpointError::Busy);
        }

        configure_socket(&stream)?;
        let session = PeerSession::new(stream, addr);
        *self.active.lock().unwrap() = Some(session.clone());
        Ok(Some(session))
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<PeerSession>> {
        if self.active.lock().unwrap().is_some() {
            return Err(EndpointError::Busy);
        }

        let addr = format!("{host}:{port}");
        let connect_fut = TcpStream::connect(&addr);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_fut).await {
            Ok(Ok(s)) => s,
            Ok(Err(_)) | Err(_) => return Err(EndpointError::Unreachable),
        };

        let peer_addr = stream.peer_addr()?;
        configure_socket(&stream)?;
        let session = PeerSession::new(stream, peer_addr);
        *self.active.lock().unwrap() = Some(session.clone());
        Ok(session)
    }

    /// Sends one frame to `session`. Serialized across all callers by the
    /// shared send mutex so control and audio frames never interleave on the
    /// wire. A hard I/O error does not close the socket itself; the caller
    /// is responsible for calling [`PeerLink::close`] and driving the FSM.
    pub async fn send(
        &self,
        session: &PeerSession,
        msg_type: u8,
        flags: u8,
        payload: &[u8],
    ) -> Result<()> {
        let frame = protocol::encode(msg_type, flags, payload)?;
        let _guard = self.send_mutex.lock().await;

        let socket = match session.socket.load_full() {
            Some(s) => s,
            None => return Err(EndpointError::Closed),
        };
        let mut stream = socket.lock().await;

        let deadline = tokio::time::Instant::now() + SEND_BUDGET;
        let mut written = 0usize;
        while written < frame.len() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(EndpointError::Incomplete);
            }
            match tokio::time::timeout(deadline - now, stream.write(&frame[written..])).await {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(EndpointError::Io(e)),
                Err(_elapsed) => return Err(EndpointError::Incomplete),
            }
        }
        Ok(())
    }

    /// Reads one frame from `session`. Returns `Err(Closed)` on clean EOF.
    pub async fn recv(&self, session: &PeerSession) -> Result<Frame> {
        let socket = match session.socket.load_full() {
            Some(s) => s,
            None => return Err(EndpointError::Closed),
        };
        let mut stream = socket.lock().await;
        protocol::decode_stream(&mut stream).await
    }

    /// Atomically swaps the socket handle to `None`, best-effort sends a
    /// `STOP`, shuts down both directions, then drops it. Safe to call
    /// concurrently with an in-flight `recv`/`send` on the same session;
    /// only the first caller to observe a `Some` handle performs the actual
    /// close.
    pub async fn close(&self, session: &PeerSession) {
        let old = session.socket.swap(None);
        *self.active.lock().unwrap() = None;

        if let Some(socket) = old {
            let mut stream = socket.lock().await;
            let stop = protocol::encode(MsgType::Stop.to_byte(), 0, &[]).unwrap_or_default();
            let _ = stream.write_all(&stop).await;
            let _ = stream.shutdown().await;
        }
    }

    /// The bound address of the listening socket, useful when `listen` was
    /// called with port 0 and the caller needs the OS-assigned port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(|| EndpointError::ProtocolViolation("not listening".into()))?
            .local_addr()
            .map_err(EndpointError::Io)
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new()
    }
}

fn configure_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = socket2::SockRef::from(stream);
    let _ = sock_ref.set_send_buffer_size(SOCKET_BUF_BYTES);
    let _ = sock_ref.set_recv_buffer_size(SOCKET_BUF_BYTES);
    Ok(())
}

/// Small adapter so `listener.accept()` can be polled once without blocking,
/// matching spec.md's non-blocking accept() semantics on top of tokio's
/// inherently-async listener.
trait NowOrNever: std::future::Future + Sized {
    fn now_or_never(self) -> Option<Self::Output>;
}

impl<F: std::future::Future> NowOrNever for F {
    fn now_or_never(self) -> Option<Self::Output> {
        use std::task::{Context, Poll};
        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = Box::pin(self);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }
}

fn futures_noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn raw_waker() -> RawWaker {
        const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_rejects_second_peer_with_busy() {
        let mut link = PeerLink::new();
        link.listen(0).await.unwrap();
        let port = link.local_addr().unwrap().port();

        let a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Give the acceptor a chance to pick it up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = link.try_accept().await.unwrap();
        assert!(first.is_some());
        drop(a);

        let b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = link.try_accept().await;
        assert!(matches!(second, Err(EndpointError::Busy)));
        drop(b);
    }

    #[tokio::test]
    async fn connect_to_unreachable_address_times_out_as_unreachable() {
        let link = PeerLink::new();
        // TEST-NET-1, nothing listens here; exercised with a short timeout
        // override would be ideal, but the 5s contract is asserted by type.
        let res = tokio::time::timeout(
            Duration::from_millis(50),
            link.connect("192.0.2.1", 6054),
        )
        .await;
        // We only assert the outer test harness doesn't hang; the real
        // 5s-unreachable contract is covered by the integration suite.
        assert!(res.is_err() || matches!(res.unwrap(), Err(EndpointError::Unreachable)));
    }
}
