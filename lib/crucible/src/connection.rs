//! Per-connection state owned by a Worker.
//!
//! A `Connection` bundles the socket, the handler, the outbound byte queue
//! and the activity timestamp. All handler callbacks run behind a panic
//! guard so application bugs take down one connection, never the Worker.

use crate::handler::{ConnectionCtx, StreamHandler};
use crate::codec::ProtocolViolation;
use crate::server::ServerRef;
use crate::worker::WorkerRef;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use std::fmt;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Monotonic per-Worker connection identifier, also used as the poll token.
pub type ConnectionId = u64;

/// Why a connection was destroyed. Reported upward exactly once per
/// connection as a `ConnectionClosed` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The remote end closed the stream.
    Disconnected,
    /// The handler or the owning server asked for the close.
    LocalClose,
    /// Graceful shutdown finished flushing the outbound queue.
    Drained,
    /// The delegator declined the connection.
    Refused,
    ProtocolViolation(ProtocolViolation),
    IoError(io::ErrorKind),
    IdleTimeout,
    /// A panic escaped a handler callback.
    HandlerPanic,
    WorkerShutdown,
}

impl CloseCause {
    /// Stable label used to tag the per-server `closed` rate.
    pub fn label(&self) -> &'static str {
        match self {
            CloseCause::Disconnected => "disconnected",
            CloseCause::LocalClose => "local_close",
            CloseCause::Drained => "drained",
            CloseCause::Refused => "refused",
            CloseCause::ProtocolViolation(_) => "protocol_violation",
            CloseCause::IoError(_) => "io_error",
            CloseCause::IdleTimeout => "idle_timeout",
            CloseCause::HandlerPanic => "handler_panic",
            CloseCause::WorkerShutdown => "worker_shutdown",
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::ProtocolViolation(violation) => write!(f, "{}", violation),
            CloseCause::IoError(kind) => write!(f, "io error: {:?}", kind),
            other => f.write_str(other.label()),
        }
    }
}

/// Who the connection belongs to: a registered Server (inbound) or the
/// system itself (outbound `connect`).
pub(crate) enum Owner {
    Server(ServerRef),
    Client,
}

impl Owner {
    pub(crate) fn server(&self) -> Option<&ServerRef> {
        match self {
            Owner::Server(server) => Some(server),
            Owner::Client => None,
        }
    }

    /// Effective idle bound, read from the owning server's current volume
    /// state. Outbound connections have no idle bound.
    pub(crate) fn max_idle_time(&self) -> Option<Duration> {
        match self {
            Owner::Server(server) => server.max_idle_time(),
            Owner::Client => None,
        }
    }
}

pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) stream: TcpStream,
    pub(crate) owner: Owner,
    pub(crate) handler: Box<dyn StreamHandler>,
    pub(crate) out: BytesMut,
    pub(crate) last_activity: Instant,
    pub(crate) draining: bool,
    pub(crate) pending_connect: bool,
    pub(crate) registered_interest: Interest,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        owner: Owner,
        handler: Box<dyn StreamHandler>,
        pending_connect: bool,
    ) -> Connection {
        Connection {
            id,
            stream,
            owner,
            handler,
            out: BytesMut::new(),
            last_activity: Instant::now(),
            draining: false,
            pending_connect,
            registered_interest: Interest::READABLE,
        }
    }

    /// Reads until `WouldBlock`, feeding every chunk to the handler.
    /// `Some(cause)` means the connection must be closed.
    pub(crate) fn read_ready(
        &mut self,
        worker: &WorkerRef,
        scratch: &mut [u8],
    ) -> Option<CloseCause> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Some(self.deliver_eof(worker)),
                Ok(count) => {
                    self.last_activity = Instant::now();

                    if let Some(cause) = self.deliver_data(worker, scratch, count) {
                        return Some(cause);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Some(CloseCause::IoError(err.kind())),
            }
        }
    }

    fn deliver_data(
        &mut self,
        worker: &WorkerRef,
        scratch: &[u8],
        count: usize,
    ) -> Option<CloseCause> {
        let Connection {
            id, handler, out, ..
        } = self;

        let mut close = None;
        let mut ctx = ConnectionCtx::new(*id, worker, out, &mut close);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.data(&scratch[..count], &mut ctx)))
        {
            Ok(Ok(())) => close,
            Ok(Err(violation)) => Some(CloseCause::ProtocolViolation(violation)),
            Err(_) => Some(CloseCause::HandlerPanic),
        }
    }

    fn deliver_eof(&mut self, worker: &WorkerRef) -> CloseCause {
        let Connection {
            id, handler, out, ..
        } = self;

        let mut close = None;
        let mut ctx = ConnectionCtx::new(*id, worker, out, &mut close);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.eof(&mut ctx))) {
            Ok(Ok(())) => close.unwrap_or(CloseCause::Disconnected),
            Ok(Err(violation)) => CloseCause::ProtocolViolation(violation),
            Err(_) => CloseCause::HandlerPanic,
        }
    }

    pub(crate) fn deliver_connected(&mut self, worker: &WorkerRef) -> Option<CloseCause> {
        let Connection {
            id, handler, out, ..
        } = self;

        let mut close = None;
        let mut ctx = ConnectionCtx::new(*id, worker, out, &mut close);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.connected(&mut ctx))) {
            Ok(()) => close,
            Err(_) => Some(CloseCause::HandlerPanic),
        }
    }

    pub(crate) fn deliver_write_ready(&mut self, worker: &WorkerRef) -> Option<CloseCause> {
        let Connection {
            id, handler, out, ..
        } = self;

        let mut close = None;
        let mut ctx = ConnectionCtx::new(*id, worker, out, &mut close);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.write_ready(&mut ctx))) {
            Ok(()) => close,
            Err(_) => Some(CloseCause::HandlerPanic),
        }
    }

    pub(crate) fn deliver_idle_check(
        &mut self,
        worker: &WorkerRef,
        elapsed: Duration,
    ) -> Option<CloseCause> {
        let Connection {
            id, handler, out, ..
        } = self;

        let mut close = None;
        let mut ctx = ConnectionCtx::new(*id, worker, out, &mut close);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.idle_check(elapsed, &mut ctx))) {
            Ok(()) => close,
            Err(_) => Some(CloseCause::HandlerPanic),
        }
    }

    /// Exactly-once termination callback. Panics are swallowed since the
    /// connection is already gone.
    pub(crate) fn deliver_terminated(&mut self, cause: &CloseCause) {
        let handler = &mut self.handler;
        let _ = panic::catch_unwind(AssertUnwindSafe(|| handler.terminated(cause)));
    }

    /// Flushes the outbound queue to the socket. `Ok(true)` when the queue
    /// fully drained.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    let _ = self.out.split_to(count);
                    self.last_activity = Instant::now();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(true)
    }

    /// Interest the poll registration should carry right now.
    pub(crate) fn desired_interest(&self) -> Interest {
        if self.draining {
            return Interest::WRITABLE;
        }

        if self.pending_connect || !self.out.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerRef;
    use std::sync::{Arc, Mutex};
    use std::thread::sleep;

    struct Recorder {
        data: Arc<Mutex<Vec<u8>>>,
        reply: &'static [u8],
    }

    impl StreamHandler for Recorder {
        fn data(
            &mut self,
            input: &[u8],
            ctx: &mut ConnectionCtx<'_>,
        ) -> Result<(), ProtocolViolation> {
            self.data.lock().unwrap().extend_from_slice(input);
            ctx.write(self.reply);
            Ok(())
        }
    }

    struct Exploder;

    impl StreamHandler for Exploder {
        fn data(
            &mut self,
            _input: &[u8],
            _ctx: &mut ConnectionCtx<'_>,
        ) -> Result<(), ProtocolViolation> {
            panic!("application bug");
        }
    }

    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        (TcpStream::from_std(accepted), client)
    }

    fn wait_for<F: FnMut() -> bool>(mut done: F) {
        for _ in 0..500 {
            if done() {
                return;
            }
            sleep(Duration::from_millis(10));
        }
        panic!("Condition not reached in time");
    }

    #[test]
    fn test_read_feeds_handler_and_queues_reply() {
        let (server, mut client) = stream_pair();
        let (worker, _mailbox) = WorkerRef::test_ref(0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            data: seen.clone(),
            reply: b"pong",
        };

        let mut conn = Connection::new(1, server, Owner::Client, Box::new(handler), false);
        let mut scratch = [0u8; 4096];

        client.write_all(b"ping").unwrap();

        let mut cause = None;
        wait_for(|| {
            cause = conn.read_ready(&worker, &mut scratch);
            cause.is_some() || !seen.lock().unwrap().is_empty()
        });

        assert_eq!(cause, None);
        assert_eq!(&seen.lock().unwrap()[..], b"ping");
        assert_eq!(&conn.out[..], b"pong");
        assert_eq!(
            conn.desired_interest(),
            Interest::READABLE | Interest::WRITABLE
        );

        assert!(conn.flush().unwrap());
        assert_eq!(conn.desired_interest(), Interest::READABLE);

        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"pong");
    }

    #[test]
    fn test_remote_close_reports_disconnected() {
        let (server, client) = stream_pair();
        let (worker, _mailbox) = WorkerRef::test_ref(0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            data: seen,
            reply: b"",
        };

        let mut conn = Connection::new(1, server, Owner::Client, Box::new(handler), false);
        let mut scratch = [0u8; 4096];

        drop(client);

        let mut cause = None;
        wait_for(|| {
            cause = conn.read_ready(&worker, &mut scratch);
            cause.is_some()
        });

        assert_eq!(cause, Some(CloseCause::Disconnected));
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let (server, mut client) = stream_pair();
        let (worker, _mailbox) = WorkerRef::test_ref(0);

        let mut conn = Connection::new(1, server, Owner::Client, Box::new(Exploder), false);
        let mut scratch = [0u8; 4096];

        client.write_all(b"boom").unwrap();

        let mut cause = None;
        wait_for(|| {
            cause = conn.read_ready(&worker, &mut scratch);
            cause.is_some()
        });

        assert_eq!(cause, Some(CloseCause::HandlerPanic));
    }
}
