//! Application-facing contracts: per-connection handlers, per-worker
//! delegators and ad-hoc tasks.
//!
//! The Worker drives connections through the object-safe byte-level
//! `StreamHandler`. Applications usually implement the typed
//! `ConnectionHandler` instead and wrap it in a `CodecDriver`, which owns
//! the codec state and does the byte/message translation in both
//! directions.

use crate::codec::{Codec, ProtocolViolation};
use crate::connection::{CloseCause, ConnectionId};
use crate::server::ServerRef;
use crate::worker::WorkerRef;
use bytes::BytesMut;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Envelope for messages fanned out to delegators via
/// `ServerRef::delegator_broadcast`.
pub type Broadcast = Arc<dyn Any + Send + Sync>;

pub type TaskId = u64;

/// Message delivered to a bound `Task` through its `TaskProxy`.
pub type TaskMessage = Box<dyn Any + Send>;

/// Connection-scoped view handed to handler callbacks. Grants access to the
/// outbound byte queue, which only the owning Worker ever touches.
pub struct ConnectionCtx<'a> {
    id: ConnectionId,
    worker: &'a WorkerRef,
    out: &'a mut BytesMut,
    close: &'a mut Option<CloseCause>,
}

impl<'a> ConnectionCtx<'a> {
    pub(crate) fn new(
        id: ConnectionId,
        worker: &'a WorkerRef,
        out: &'a mut BytesMut,
        close: &'a mut Option<CloseCause>,
    ) -> ConnectionCtx<'a> {
        ConnectionCtx {
            id,
            worker,
            out,
            close,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    pub fn worker(&self) -> &WorkerRef {
        self.worker
    }

    /// Queues raw bytes for transmission.
    pub fn write(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Requests a graceful close once control returns to the Worker.
    pub fn close(&mut self) {
        self.close_with(CloseCause::LocalClose);
    }

    /// As `close`, with an explicit cause. The first requested cause wins.
    pub fn close_with(&mut self, cause: CloseCause) {
        if self.close.is_none() {
            *self.close = Some(cause);
        }
    }
}

/// Byte-level per-connection handler, the contract the Worker drives.
///
/// Handlers must not block; long-running work belongs on a `Task`. A panic
/// escaping any callback closes the connection with
/// `CloseCause::HandlerPanic` and leaves the Worker running.
pub trait StreamHandler: Send {
    /// Called once, after the connection is registered with its Worker.
    fn connected(&mut self, _ctx: &mut ConnectionCtx<'_>) {}

    /// A chunk of bytes arrived, in arrival order.
    fn data(&mut self, input: &[u8], ctx: &mut ConnectionCtx<'_>)
        -> Result<(), ProtocolViolation>;

    /// The peer signalled end-of-stream. The connection closes with
    /// `Disconnected` afterwards unless the handler requested otherwise.
    fn eof(&mut self, _ctx: &mut ConnectionCtx<'_>) -> Result<(), ProtocolViolation> {
        Ok(())
    }

    /// The outbound queue drained to the socket.
    fn write_ready(&mut self, _ctx: &mut ConnectionCtx<'_>) {}

    /// Periodic idle probe with the time since the last activity.
    fn idle_check(&mut self, _elapsed: Duration, _ctx: &mut ConnectionCtx<'_>) {}

    /// Delivered exactly once, when the connection is destroyed.
    fn terminated(&mut self, _cause: &CloseCause) {}
}

/// Typed view over a `ConnectionCtx` that encodes outbound messages through
/// the connection's codec.
pub struct MessageCtx<'a, 'b, C: Codec> {
    inner: &'a mut ConnectionCtx<'b>,
    _codec: PhantomData<C>,
}

impl<'a, 'b, C: Codec> MessageCtx<'a, 'b, C> {
    fn new(inner: &'a mut ConnectionCtx<'b>) -> MessageCtx<'a, 'b, C> {
        MessageCtx {
            inner,
            _codec: PhantomData,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id()
    }

    pub fn worker(&self) -> &WorkerRef {
        self.inner.worker()
    }

    /// Encodes `message` onto the outbound queue.
    pub fn send(&mut self, message: &C::Out) {
        C::encode(message, self.inner.out);
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn close_with(&mut self, cause: CloseCause) {
        self.inner.close_with(cause);
    }
}

/// Message-level per-connection handler; the usual application surface.
pub trait ConnectionHandler: Send {
    type Codec: Codec;

    fn connected(&mut self, _ctx: &mut MessageCtx<Self::Codec>) {}

    /// One decoded message, in byte-arrival order.
    fn message(
        &mut self,
        message: <Self::Codec as Codec>::In,
        ctx: &mut MessageCtx<Self::Codec>,
    );

    fn write_ready(&mut self, _ctx: &mut MessageCtx<Self::Codec>) {}

    fn idle_check(&mut self, _elapsed: Duration, _ctx: &mut MessageCtx<Self::Codec>) {}

    fn terminated(&mut self, _cause: &CloseCause) {}
}

/// Adapts a `ConnectionHandler` onto the byte-level contract by running its
/// codec over every inbound chunk.
pub struct CodecDriver<H: ConnectionHandler> {
    codec: H::Codec,
    handler: H,
    inbox: Vec<<H::Codec as Codec>::In>,
}

impl<H: ConnectionHandler> CodecDriver<H> {
    pub fn new(codec: H::Codec, handler: H) -> CodecDriver<H> {
        CodecDriver {
            codec,
            handler,
            inbox: Vec::new(),
        }
    }
}

impl<H: ConnectionHandler + 'static> CodecDriver<H> {
    pub fn boxed(codec: H::Codec, handler: H) -> Box<dyn StreamHandler> {
        Box::new(CodecDriver::new(codec, handler))
    }
}

impl<H: ConnectionHandler> StreamHandler for CodecDriver<H> {
    fn connected(&mut self, ctx: &mut ConnectionCtx<'_>) {
        self.handler.connected(&mut MessageCtx::new(ctx));
    }

    fn data(
        &mut self,
        input: &[u8],
        ctx: &mut ConnectionCtx<'_>,
    ) -> Result<(), ProtocolViolation> {
        self.codec.decode(input, &mut self.inbox)?;

        for message in self.inbox.drain(..) {
            self.handler.message(message, &mut MessageCtx::new(ctx));
        }

        Ok(())
    }

    fn eof(&mut self, ctx: &mut ConnectionCtx<'_>) -> Result<(), ProtocolViolation> {
        if let Some(message) = self.codec.eof()? {
            self.handler.message(message, &mut MessageCtx::new(ctx));
        }

        Ok(())
    }

    fn write_ready(&mut self, ctx: &mut ConnectionCtx<'_>) {
        self.handler.write_ready(&mut MessageCtx::new(ctx));
    }

    fn idle_check(&mut self, elapsed: Duration, ctx: &mut ConnectionCtx<'_>) {
        self.handler.idle_check(elapsed, &mut MessageCtx::new(ctx));
    }

    fn terminated(&mut self, cause: &CloseCause) {
        self.handler.terminated(cause);
    }
}

/// Per-(Server, Worker) factory for connection handlers, and the recipient
/// of delegator broadcasts.
pub trait Delegator: Send {
    /// Produces the handler for a newly assigned connection, or `None` to
    /// refuse it (the Worker then closes the socket with
    /// `CloseCause::Refused`).
    fn accept_connection(&mut self, id: ConnectionId) -> Option<Box<dyn StreamHandler>>;

    /// A message fanned out via `ServerRef::delegator_broadcast`.
    fn handle_broadcast(&mut self, _message: &Broadcast) {}
}

/// Creates one `Delegator` per Worker when a Server is registered with the
/// pool.
pub trait DelegatorFactory: Send + Sync {
    fn delegator(&self, server: ServerRef, worker: WorkerRef) -> Box<dyn Delegator>;
}

impl<F> DelegatorFactory for F
where
    F: Fn(ServerRef, WorkerRef) -> Box<dyn Delegator> + Send + Sync,
{
    fn delegator(&self, server: ServerRef, worker: WorkerRef) -> Box<dyn Delegator> {
        self(server, worker)
    }
}

/// Ad-hoc work bound to a Worker loop via `IOSystem::run`. Tasks receive
/// messages through their `TaskProxy` like any other handler and must not
/// block.
pub trait Task: Send {
    /// Called once, on the owning Worker's thread, after binding.
    fn bound(&mut self, _worker: &WorkerRef) {}

    fn receive(&mut self, message: TaskMessage);
}
