//! Single-threaded Worker event loops.
//!
//! A Worker is the sole owner of its poll, its connection map, its
//! per-server delegators and its task table. Every external input arrives
//! as a `WorkerMsg` on the mailbox; the loop alternates between a bounded
//! selector wait, readiness dispatch, mailbox drain and a coarse
//! housekeeping tick.

use crate::connection::{CloseCause, Connection, ConnectionId, Owner};
use crate::handler::{
    Broadcast, Delegator, DelegatorFactory, StreamHandler, Task, TaskId, TaskMessage,
};
use crate::server::{ServerId, ServerMsg, ServerRef};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use flint::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type WorkerId = usize;

const WAKER_TOKEN: Token = Token(usize::MAX);
const SELECT_TIMEOUT: Duration = Duration::from_millis(5);
const TICK_INTERVAL: Duration = Duration::from_millis(100);
const SCRATCH_SIZE: usize = 16 * 1024;
const EVENT_CAPACITY: usize = 1024;

pub(crate) enum WorkerMsg {
    /// Accepted server-side socket assigned by the Manager.
    Bind {
        stream: TcpStream,
        server: ServerRef,
    },
    /// Outbound connection initiated through `IOSystem::connect`.
    Connect {
        addr: SocketAddr,
        handler: Box<dyn StreamHandler>,
    },
    Register {
        server: ServerRef,
        factory: Arc<dyn DelegatorFactory>,
    },
    Unregister {
        server: ServerId,
    },
    CloseServer {
        server: ServerId,
        kill: bool,
    },
    Broadcast {
        server: ServerId,
        message: Broadcast,
    },
    Schedule {
        id: TaskId,
        task: Box<dyn Task>,
    },
    TaskMessage {
        id: TaskId,
        message: TaskMessage,
    },
    Shutdown {
        mode: ShutdownMode,
        ack: Sender<WorkerId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownMode {
    /// Flush outbound queues and deliver termination callbacks.
    Drain,
    /// Drop everything on the floor. Used by `apocalypse`.
    Kill,
}

/// Cheap cloneable address of a Worker. Sending through it enqueues on the
/// Worker's mailbox and wakes its selector.
#[derive(Clone)]
pub struct WorkerRef {
    id: WorkerId,
    tx: Sender<WorkerMsg>,
    waker: Arc<Waker>,
}

impl WorkerRef {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Fails only when the Worker's loop has exited.
    pub(crate) fn send(&self, message: WorkerMsg) -> Result<(), ()> {
        self.tx.send(message).map_err(|_| ())?;
        let _ = self.waker.wake();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_ref(id: WorkerId) -> (WorkerRef, Receiver<WorkerMsg>) {
        let poll = Box::leak(Box::new(Poll::new().expect("Poll creation failed")));
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).expect("Waker creation failed");
        let (tx, rx) = unbounded();

        (
            WorkerRef {
                id,
                tx,
                waker: Arc::new(waker),
            },
            rx,
        )
    }
}

impl fmt::Debug for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRef").field("id", &self.id).finish()
    }
}

pub(crate) struct WorkerHandle {
    pub(crate) wref: WorkerRef,
    pub(crate) thread: JoinHandle<()>,
}

/// Spawns a Worker loop on its own named thread.
pub(crate) fn spawn(id: WorkerId, log: &Logger) -> io::Result<WorkerHandle> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (tx, rx) = unbounded();

    let wref = WorkerRef { id, tx, waker };

    let worker = Worker {
        id,
        poll,
        mailbox: rx,
        connections: HashMap::new(),
        delegators: IndexMap::new(),
        tasks: HashMap::new(),
        next_connection: 0,
        self_ref: wref.clone(),
        log: log.new(logging::o!("worker" => id)),
    };

    let thread = thread::Builder::new()
        .name(format!("worker-{}", id))
        .spawn(move || worker.run())?;

    Ok(WorkerHandle { wref, thread })
}

enum Flow {
    Continue,
    Stop(ShutdownMode, Option<Sender<WorkerId>>),
}

struct Worker {
    id: WorkerId,
    poll: Poll,
    mailbox: Receiver<WorkerMsg>,
    connections: HashMap<ConnectionId, Connection>,
    delegators: IndexMap<ServerId, Box<dyn Delegator>>,
    tasks: HashMap<TaskId, Box<dyn Task>>,
    next_connection: ConnectionId,
    self_ref: WorkerRef,
    log: Logger,
}

impl Worker {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut scratch = vec![0u8; SCRATCH_SIZE];

        let mut last_tick = Instant::now();

        logging::debug!(self.log, "worker loop started"; "context" => "run");

        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                logging::crit!(self.log, "worker poll failed";
                               "context" => "run",
                               "error" => %err);
                return;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }

                self.stream_event(
                    event.token(),
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                    &mut scratch,
                );
            }

            match self.drain_mailbox() {
                Flow::Continue => {}
                Flow::Stop(mode, ack) => {
                    self.shutdown(mode);

                    if let Some(ack) = ack {
                        let _ = ack.send(self.id);
                    }

                    return;
                }
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                last_tick = Instant::now();
                self.tick();
            }
        }
    }

    fn stream_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        errored: bool,
        scratch: &mut [u8],
    ) {
        let id = token.0 as ConnectionId;
        let worker = self.self_ref.clone();

        let cause = match self.connections.get_mut(&id) {
            // Stale readiness for a connection closed earlier this pass.
            None => return,
            Some(conn) => {
                let mut cause = None;

                if errored {
                    cause = Some(CloseCause::IoError(io::ErrorKind::Other));
                }

                if cause.is_none() && writable && conn.pending_connect {
                    cause = Self::finish_connect(conn, &worker);
                }

                if cause.is_none() && readable && !conn.draining && !conn.pending_connect {
                    cause = conn.read_ready(&worker, scratch);
                }

                if cause.is_none() && !conn.pending_connect && (writable || !conn.out.is_empty()) {
                    cause = Self::flush_connection(conn, &worker);
                }

                cause
            }
        };

        match cause {
            Some(cause) => self.close_connection(id, cause),
            None => self.update_interest(id),
        }
    }

    /// Resolves a non-blocking connect once the socket turns writable.
    fn finish_connect(conn: &mut Connection, worker: &WorkerRef) -> Option<CloseCause> {
        match conn.stream.take_error() {
            Ok(Some(err)) => return Some(CloseCause::IoError(err.kind())),
            Err(err) => return Some(CloseCause::IoError(err.kind())),
            Ok(None) => {}
        }

        match conn.stream.peer_addr() {
            Ok(_) => {
                conn.pending_connect = false;
                conn.last_activity = Instant::now();
                conn.deliver_connected(worker)
                    .or_else(|| Self::flush_connection(conn, worker))
            }
            // Still connecting.
            Err(err) if err.kind() == io::ErrorKind::NotConnected => None,
            Err(err) => Some(CloseCause::IoError(err.kind())),
        }
    }

    fn flush_connection(conn: &mut Connection, worker: &WorkerRef) -> Option<CloseCause> {
        let had_output = !conn.out.is_empty();

        match conn.flush() {
            Ok(true) => {
                if conn.draining {
                    return Some(CloseCause::Drained);
                }

                if had_output {
                    conn.deliver_write_ready(worker)
                } else {
                    None
                }
            }
            Ok(false) => None,
            Err(err) => Some(CloseCause::IoError(err.kind())),
        }
    }

    fn drain_mailbox(&mut self) -> Flow {
        loop {
            match self.mailbox.try_recv() {
                Ok(message) => {
                    if let Some(stop) = self.dispatch(message) {
                        return stop;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                // Every sender is gone, the system has been dropped.
                Err(TryRecvError::Disconnected) => {
                    return Flow::Stop(ShutdownMode::Kill, None)
                }
            }
        }
    }

    fn dispatch(&mut self, message: WorkerMsg) -> Option<Flow> {
        match message {
            WorkerMsg::Bind { stream, server } => self.bind_connection(stream, server),
            WorkerMsg::Connect { addr, handler } => self.open_connection(addr, handler),
            WorkerMsg::Register { server, factory } => {
                let delegator = factory.delegator(server.clone(), self.self_ref.clone());
                self.delegators.insert(server.server_id(), delegator);

                logging::debug!(self.log, "server registered";
                                "context" => "register",
                                "server" => server.name());
            }
            WorkerMsg::Unregister { server } => {
                self.delegators.shift_remove(&server);
            }
            WorkerMsg::CloseServer { server, kill } => {
                self.close_server_connections(server, kill)
            }
            WorkerMsg::Broadcast { server, message } => {
                if let Some(delegator) = self.delegators.get_mut(&server) {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                        delegator.handle_broadcast(&message)
                    }));
                }
            }
            WorkerMsg::Schedule { id, task } => {
                let mut task = task;
                let worker = self.self_ref.clone();

                if panic::catch_unwind(AssertUnwindSafe(|| task.bound(&worker))).is_ok() {
                    self.tasks.insert(id, task);
                }
            }
            WorkerMsg::TaskMessage { id, message } => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| task.receive(message)));
                }
            }
            WorkerMsg::Shutdown { mode, ack } => return Some(Flow::Stop(mode, Some(ack))),
        }

        None
    }

    fn bind_connection(&mut self, mut stream: TcpStream, server: ServerRef) {
        let id = self.allocate_id();

        // Attribution first so the owning server can reconcile on worker
        // death regardless of how the bind turns out.
        let _ = server.send(ServerMsg::ConnectionOpened { worker: self.id });

        let handler = match self.delegators.get_mut(&server.server_id()) {
            Some(delegator) => {
                match panic::catch_unwind(AssertUnwindSafe(|| delegator.accept_connection(id))) {
                    Ok(handler) => handler,
                    Err(_) => None,
                }
            }
            None => None,
        };

        let handler = match handler {
            Some(handler) => handler,
            None => {
                logging::debug!(self.log, "connection refused by delegator";
                                "context" => "bind",
                                "connection_id" => id,
                                "server" => server.name());

                let _ = server.send(ServerMsg::ConnectionClosed {
                    id,
                    worker: self.id,
                    cause: CloseCause::Refused,
                });
                return;
            }
        };

        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, Token(id as usize), Interest::READABLE)
        {
            logging::warn!(self.log, "connection registration failed";
                           "context" => "bind",
                           "connection_id" => id,
                           "error" => %err);

            let _ = server.send(ServerMsg::ConnectionClosed {
                id,
                worker: self.id,
                cause: CloseCause::IoError(err.kind()),
            });
            return;
        }

        logging::debug!(self.log, "connection bound";
                        "context" => "bind",
                        "connection_id" => id,
                        "server" => server.name());

        let conn = Connection::new(id, stream, Owner::Server(server), handler, false);
        self.connections.insert(id, conn);

        self.after_handler(id, |conn, worker| conn.deliver_connected(worker));
    }

    fn open_connection(&mut self, addr: SocketAddr, handler: Box<dyn StreamHandler>) {
        let id = self.allocate_id();

        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                logging::warn!(self.log, "outbound connect failed";
                               "context" => "connect",
                               "addr" => %addr,
                               "error" => %err);
                return;
            }
        };

        let _ = stream.set_nodelay(true);

        let interest = Interest::READABLE | Interest::WRITABLE;
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, Token(id as usize), interest)
        {
            logging::warn!(self.log, "outbound registration failed";
                           "context" => "connect",
                           "addr" => %addr,
                           "error" => %err);
            return;
        }

        let mut conn = Connection::new(id, stream, Owner::Client, handler, true);
        conn.registered_interest = interest;
        self.connections.insert(id, conn);

        logging::debug!(self.log, "outbound connection opened";
                        "context" => "connect",
                        "connection_id" => id,
                        "addr" => %addr);
    }

    fn close_server_connections(&mut self, server: ServerId, kill: bool) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.owner.server().map(ServerRef::server_id) == Some(server))
            .map(|(&id, _)| id)
            .collect();

        logging::debug!(self.log, "closing server connections";
                        "context" => "close_server",
                        "server" => server,
                        "count" => ids.len(),
                        "kill" => kill);

        for id in ids {
            if kill {
                self.close_connection(id, CloseCause::LocalClose);
                continue;
            }

            let empty = match self.connections.get_mut(&id) {
                Some(conn) => {
                    conn.draining = true;
                    conn.out.is_empty()
                }
                None => continue,
            };

            if empty {
                self.close_connection(id, CloseCause::Drained);
            } else {
                self.update_interest(id);
            }
        }
    }

    /// Idle housekeeping at tick resolution.
    fn tick(&mut self) {
        let now = Instant::now();
        let worker = self.self_ref.clone();

        let mut closing: Vec<(ConnectionId, CloseCause)> = Vec::new();
        let mut touched: Vec<ConnectionId> = Vec::new();

        for (&id, conn) in self.connections.iter_mut() {
            if conn.draining {
                if conn.out.is_empty() {
                    closing.push((id, CloseCause::Drained));
                }
                continue;
            }

            if conn.pending_connect {
                continue;
            }

            let elapsed = now.duration_since(conn.last_activity);
            let queued_before = conn.out.len();

            if let Some(cause) = conn.deliver_idle_check(&worker, elapsed) {
                closing.push((id, cause));
                continue;
            }

            if let Some(bound) = conn.owner.max_idle_time() {
                if elapsed >= bound {
                    closing.push((id, CloseCause::IdleTimeout));
                    continue;
                }
            }

            if conn.out.len() > queued_before {
                touched.push(id);
            }
        }

        for (id, cause) in closing {
            self.close_connection(id, cause);
        }

        for id in touched {
            self.after_handler(id, |_, _| None);
        }
    }

    /// Flush + interest maintenance after a handler had the chance to queue
    /// output, with an optional leading callback.
    fn after_handler<F>(&mut self, id: ConnectionId, callback: F)
    where
        F: FnOnce(&mut Connection, &WorkerRef) -> Option<CloseCause>,
    {
        let worker = self.self_ref.clone();

        let cause = match self.connections.get_mut(&id) {
            None => return,
            Some(conn) => {
                callback(conn, &worker).or_else(|| Self::flush_connection(conn, &worker))
            }
        };

        match cause {
            Some(cause) => self.close_connection(id, cause),
            None => self.update_interest(id),
        }
    }

    fn update_interest(&mut self, id: ConnectionId) {
        let failed = match self.connections.get_mut(&id) {
            None => return,
            Some(conn) => {
                let desired = conn.desired_interest();

                if desired == conn.registered_interest {
                    return;
                }

                match self
                    .poll
                    .registry()
                    .reregister(&mut conn.stream, Token(id as usize), desired)
                {
                    Ok(()) => {
                        conn.registered_interest = desired;
                        return;
                    }
                    Err(err) => err,
                }
            }
        };

        logging::warn!(self.log, "interest update failed";
                       "context" => "reregister",
                       "connection_id" => id,
                       "error" => %failed);

        self.close_connection(id, CloseCause::IoError(failed.kind()));
    }

    fn close_connection(&mut self, id: ConnectionId, cause: CloseCause) {
        let mut conn = match self.connections.remove(&id) {
            Some(conn) => conn,
            None => return,
        };

        let _ = self.poll.registry().deregister(&mut conn.stream);

        conn.deliver_terminated(&cause);

        if let Some(server) = conn.owner.server() {
            let _ = server.send(ServerMsg::ConnectionClosed {
                id,
                worker: self.id,
                cause: cause.clone(),
            });
        }

        logging::debug!(self.log, "connection closed";
                        "context" => "close",
                        "connection_id" => id,
                        "cause" => %cause);
    }

    fn shutdown(&mut self, mode: ShutdownMode) {
        logging::info!(self.log, "worker shutting down";
                       "context" => "shutdown",
                       "mode" => ?mode,
                       "connections" => self.connections.len());

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();

        for id in ids {
            match mode {
                ShutdownMode::Drain => {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        let _ = conn.flush();
                    }
                    self.close_connection(id, CloseCause::WorkerShutdown);
                }
                ShutdownMode::Kill => {
                    if let Some(mut conn) = self.connections.remove(&id) {
                        let _ = self.poll.registry().deregister(&mut conn.stream);
                    }
                }
            }
        }

        self.tasks.clear();
        self.delegators.clear();
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolViolation;
    use crate::handler::ConnectionCtx;
    use crate::server::test_support::server_stub;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoRaw;

    impl StreamHandler for EchoRaw {
        fn data(
            &mut self,
            input: &[u8],
            ctx: &mut ConnectionCtx<'_>,
        ) -> Result<(), ProtocolViolation> {
            ctx.write(input);
            Ok(())
        }
    }

    struct CountingDelegator {
        accepted: Arc<AtomicUsize>,
        broadcasts: Arc<AtomicUsize>,
        refuse: bool,
    }

    impl Delegator for CountingDelegator {
        fn accept_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn StreamHandler>> {
            if self.refuse {
                return None;
            }

            self.accepted.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(EchoRaw))
        }

        fn handle_broadcast(&mut self, _message: &Broadcast) {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        handle: WorkerHandle,
        server: ServerRef,
        server_rx: Receiver<ServerMsg>,
        accepted: Arc<AtomicUsize>,
        broadcasts: Arc<AtomicUsize>,
    }

    fn fixture(refuse: bool, max_idle: Option<Duration>) -> Fixture {
        let log = flint::logging::discard();
        let handle = spawn(0, &log).unwrap();

        let (server, server_rx) = server_stub("test", max_idle);

        let accepted = Arc::new(AtomicUsize::new(0));
        let broadcasts = Arc::new(AtomicUsize::new(0));

        let accepted_in = accepted.clone();
        let broadcasts_in = broadcasts.clone();

        let factory = Arc::new(move |_server: ServerRef, _worker: WorkerRef| {
            Box::new(CountingDelegator {
                accepted: accepted_in.clone(),
                broadcasts: broadcasts_in.clone(),
                refuse,
            }) as Box<dyn Delegator>
        });

        handle
            .wref
            .send(WorkerMsg::Register {
                server: server.clone(),
                factory,
            })
            .unwrap();

        Fixture {
            handle,
            server,
            server_rx,
            accepted,
            broadcasts,
        }
    }

    fn bind_client(fixture: &Fixture) -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        fixture
            .handle
            .wref
            .send(WorkerMsg::Bind {
                stream: TcpStream::from_std(accepted),
                server: fixture.server.clone(),
            })
            .unwrap();

        client
    }

    fn expect_close(rx: &Receiver<ServerMsg>) -> CloseCause {
        let deadline = Instant::now() + Duration::from_secs(5);

        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ServerMsg::ConnectionClosed { cause, .. }) => return cause,
                Ok(_) => continue,
                Err(_) => continue,
            }
        }

        panic!("No ConnectionClosed report arrived");
    }

    #[test]
    fn test_echo_through_worker() {
        let fixture = fixture(false, None);
        let mut client = bind_client(&fixture);

        client.write_all(b"roundabout").unwrap();

        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"roundabout");
        assert_eq!(fixture.accepted.load(Ordering::SeqCst), 1);

        // Remote close surfaces as a Disconnected report to the server.
        drop(client);
        assert_eq!(expect_close(&fixture.server_rx), CloseCause::Disconnected);
    }

    #[test]
    fn test_delegator_refusal_closes_with_refused() {
        let fixture = fixture(true, None);
        let mut client = bind_client(&fixture);

        assert_eq!(expect_close(&fixture.server_rx), CloseCause::Refused);

        // The socket is gone from the client's point of view.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(fixture.accepted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_idle_timeout_close() {
        let fixture = fixture(false, Some(Duration::from_millis(50)));
        let mut client = bind_client(&fixture);

        assert_eq!(expect_close(&fixture.server_rx), CloseCause::IdleTimeout);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_broadcast_reaches_delegator() {
        let fixture = fixture(false, None);

        fixture
            .handle
            .wref
            .send(WorkerMsg::Broadcast {
                server: fixture.server.server_id(),
                message: Arc::new("reload".to_string()),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fixture.broadcasts.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "broadcast never delivered");
            thread::sleep(Duration::from_millis(10));
        }
    }

    struct FlagTask {
        received: Arc<Mutex<Vec<String>>>,
    }

    impl Task for FlagTask {
        fn receive(&mut self, message: TaskMessage) {
            if let Ok(text) = message.downcast::<String>() {
                self.received.lock().unwrap().push(*text);
            }
        }
    }

    #[test]
    fn test_task_receives_messages() {
        let fixture = fixture(false, None);
        let received = Arc::new(Mutex::new(Vec::new()));

        fixture
            .handle
            .wref
            .send(WorkerMsg::Schedule {
                id: 9,
                task: Box::new(FlagTask {
                    received: received.clone(),
                }),
            })
            .unwrap();

        fixture
            .handle
            .wref
            .send(WorkerMsg::TaskMessage {
                id: 9,
                message: Box::new("tick".to_string()),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while received.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "task message never delivered");
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(received.lock().unwrap()[0], "tick");
    }

    #[test]
    fn test_shutdown_acknowledges() {
        let fixture = fixture(false, None);
        let (ack_tx, ack_rx) = unbounded();

        fixture
            .handle
            .wref
            .send(WorkerMsg::Shutdown {
                mode: ShutdownMode::Drain,
                ack: ack_tx,
            })
            .unwrap();

        assert_eq!(ack_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        fixture.handle.thread.join().unwrap();
    }
}
