//! WorkerManager: owns the fixed Worker pool and routes everything that
//! targets "some worker": new-connection assignments, outbound connects and
//! task bindings round-robin, registrations and broadcasts fanned out.
//!
//! A Worker that dies is restarted with an empty state: its live
//! connections are lost, current server registrations are replayed into the
//! replacement, and every registered Server gets a `WorkerDead`
//! notification so its open-connection accounting can reconcile.

use crate::handler::{Broadcast, DelegatorFactory, StreamHandler, Task, TaskId, TaskMessage};
use crate::server::{ServerId, ServerMsg, ServerRef};
use crate::worker::{self, ShutdownMode, WorkerHandle, WorkerId, WorkerMsg};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use flint::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::net::TcpStream;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum ManagerMsg {
    Assign {
        stream: TcpStream,
        server: ServerRef,
    },
    Connect {
        addr: SocketAddr,
        handler: Box<dyn StreamHandler>,
    },
    RegisterServer {
        server: ServerRef,
        factory: Arc<dyn DelegatorFactory>,
    },
    UnregisterServer {
        server: ServerId,
        kill: bool,
    },
    Broadcast {
        server: ServerId,
        message: Broadcast,
    },
    Schedule {
        task: Box<dyn Task>,
        reply: Sender<TaskProxy>,
    },
    TaskMessage {
        id: TaskId,
        message: TaskMessage,
    },
    Shutdown {
        mode: ShutdownMode,
        ack: Sender<()>,
    },
}

/// Cheap cloneable address of the Manager loop.
#[derive(Clone)]
pub struct ManagerRef {
    tx: Sender<ManagerMsg>,
}

impl ManagerRef {
    pub(crate) fn send(&self, message: ManagerMsg) -> Result<(), ()> {
        self.tx.send(message).map_err(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn test_ref() -> (ManagerRef, Receiver<ManagerMsg>) {
        let (tx, rx) = unbounded();
        (ManagerRef { tx }, rx)
    }
}

impl fmt::Debug for ManagerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRef").finish()
    }
}

/// Handle to a Task bound on some Worker. Messages route through the
/// Manager, which knows which Worker hosts the task.
pub struct TaskProxy {
    id: TaskId,
    manager: ManagerRef,
}

impl TaskProxy {
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Fails only when the whole system has shut down.
    pub fn send(&self, message: TaskMessage) -> Result<(), ()> {
        self.manager.send(ManagerMsg::TaskMessage {
            id: self.id,
            message,
        })
    }
}

impl fmt::Debug for TaskProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProxy").field("id", &self.id).finish()
    }
}

pub(crate) struct ManagerHandle {
    pub(crate) mref: ManagerRef,
    pub(crate) thread: JoinHandle<()>,
}

/// Spawns the Worker pool and the Manager loop that owns it.
pub(crate) fn spawn(num_workers: usize, log: &Logger) -> io::Result<ManagerHandle> {
    let mut workers = Vec::with_capacity(num_workers);

    for id in 0..num_workers {
        workers.push(worker::spawn(id, log)?);
    }

    let (tx, rx) = unbounded();
    let mref = ManagerRef { tx };

    let manager = WorkerManager {
        workers,
        cursor: 0,
        registrations: IndexMap::new(),
        tasks: HashMap::new(),
        next_task: 0,
        mailbox: rx,
        self_ref: mref.clone(),
        root: log.clone(),
        log: log.new(logging::o!("component" => "manager")),
    };

    let thread = thread::Builder::new()
        .name("worker-manager".to_string())
        .spawn(move || manager.run())?;

    Ok(ManagerHandle { mref, thread })
}

struct WorkerManager {
    workers: Vec<WorkerHandle>,
    cursor: usize,
    registrations: IndexMap<ServerId, (ServerRef, Arc<dyn DelegatorFactory>)>,
    tasks: HashMap<TaskId, WorkerId>,
    next_task: TaskId,
    mailbox: Receiver<ManagerMsg>,
    self_ref: ManagerRef,
    root: Logger,
    log: Logger,
}

impl WorkerManager {
    fn run(mut self) {
        logging::debug!(self.log, "manager loop started";
                        "context" => "run",
                        "workers" => self.workers.len());

        loop {
            match self.mailbox.recv_timeout(LIVENESS_INTERVAL) {
                Ok(message) => {
                    if let Some((mode, ack)) = self.dispatch(message) {
                        self.shutdown(mode);

                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }

                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.sweep(),
                Err(RecvTimeoutError::Disconnected) => {
                    self.shutdown(ShutdownMode::Kill);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, message: ManagerMsg) -> Option<(ShutdownMode, Option<Sender<()>>)> {
        match message {
            ManagerMsg::Assign { stream, server } => self.assign(stream, server),
            ManagerMsg::Connect { addr, handler } => self.connect(addr, handler),
            ManagerMsg::RegisterServer { server, factory } => {
                self.register_server(server, factory)
            }
            ManagerMsg::UnregisterServer { server, kill } => {
                self.registrations.shift_remove(&server);

                for handle in &self.workers {
                    let _ = handle.wref.send(WorkerMsg::CloseServer { server, kill });
                    let _ = handle.wref.send(WorkerMsg::Unregister { server });
                }
            }
            ManagerMsg::Broadcast { server, message } => {
                for handle in &self.workers {
                    let _ = handle.wref.send(WorkerMsg::Broadcast {
                        server,
                        message: message.clone(),
                    });
                }
            }
            ManagerMsg::Schedule { task, reply } => self.schedule(task, reply),
            ManagerMsg::TaskMessage { id, message } => {
                if let Some(&worker) = self.tasks.get(&id) {
                    if let Some(handle) = self.workers.get(worker) {
                        let _ = handle.wref.send(WorkerMsg::TaskMessage { id, message });
                    }
                }
            }
            ManagerMsg::Shutdown { mode, ack } => return Some((mode, Some(ack))),
        }

        None
    }

    fn assign(&mut self, stream: TcpStream, server: ServerRef) {
        let idx = match self.next_worker() {
            Some(idx) => idx,
            None => {
                logging::warn!(self.log, "no workers available, dropping connection";
                               "context" => "assign",
                               "server" => server.name());

                let _ = server.send(ServerMsg::AssignFailed);
                return;
            }
        };

        if self.workers[idx]
            .wref
            .send(WorkerMsg::Bind {
                stream,
                server: server.clone(),
            })
            .is_err()
        {
            logging::error!(self.log, "assignment lost to dying worker";
                            "context" => "assign",
                            "worker" => idx,
                            "server" => server.name());

            let _ = server.send(ServerMsg::AssignFailed);
        }
    }

    fn connect(&mut self, addr: SocketAddr, handler: Box<dyn StreamHandler>) {
        match self.next_worker() {
            Some(idx) => {
                let _ = self.workers[idx]
                    .wref
                    .send(WorkerMsg::Connect { addr, handler });
            }
            None => {
                logging::warn!(self.log, "no workers available, dropping outbound connect";
                               "context" => "connect",
                               "addr" => %addr);
            }
        }
    }

    fn register_server(&mut self, server: ServerRef, factory: Arc<dyn DelegatorFactory>) {
        for handle in &self.workers {
            let _ = handle.wref.send(WorkerMsg::Register {
                server: server.clone(),
                factory: factory.clone(),
            });
        }

        self.registrations
            .insert(server.server_id(), (server.clone(), factory));

        logging::info!(self.log, "server registered with pool";
                       "context" => "register",
                       "server" => server.name(),
                       "workers" => self.workers.len());

        let _ = server.send(ServerMsg::WorkersReady);
    }

    fn schedule(&mut self, task: Box<dyn Task>, reply: Sender<TaskProxy>) {
        let id = self.next_task;
        self.next_task += 1;

        match self.next_worker() {
            Some(idx) => {
                if self.workers[idx]
                    .wref
                    .send(WorkerMsg::Schedule { id, task })
                    .is_ok()
                {
                    self.tasks.insert(id, idx);
                }
            }
            None => {
                logging::warn!(self.log, "no workers available, task dropped";
                               "context" => "schedule",
                               "task" => id);
            }
        }

        let _ = reply.send(TaskProxy {
            id,
            manager: self.self_ref.clone(),
        });
    }

    /// Round-robin cursor over the pool, restarting the picked Worker first
    /// if its thread has exited.
    fn next_worker(&mut self) -> Option<usize> {
        if self.workers.is_empty() {
            return None;
        }

        let idx = self.cursor % self.workers.len();
        self.cursor = self.cursor.wrapping_add(1);
        self.ensure_alive(idx);

        Some(idx)
    }

    fn sweep(&mut self) {
        for idx in 0..self.workers.len() {
            self.ensure_alive(idx);
        }
    }

    fn ensure_alive(&mut self, idx: usize) {
        if !self.workers[idx].thread.is_finished() {
            return;
        }

        logging::error!(self.log, "worker died, restarting with empty state";
                        "context" => "restart",
                        "worker" => idx);

        match worker::spawn(idx, &self.root) {
            Ok(handle) => {
                for (server, factory) in self.registrations.values() {
                    let _ = handle.wref.send(WorkerMsg::Register {
                        server: server.clone(),
                        factory: factory.clone(),
                    });
                }

                // Tasks bound to the dead worker are gone.
                self.tasks.retain(|_, worker| *worker != idx);

                for (server, _) in self.registrations.values() {
                    let _ = server.send(ServerMsg::WorkerDead { worker: idx });
                }

                self.workers[idx] = handle;
            }
            Err(err) => {
                logging::crit!(self.log, "worker restart failed";
                               "context" => "restart",
                               "worker" => idx,
                               "error" => %err);
            }
        }
    }

    fn shutdown(&mut self, mode: ShutdownMode) {
        logging::info!(self.log, "manager shutting down";
                       "context" => "shutdown",
                       "mode" => ?mode);

        let (ack_tx, ack_rx) = unbounded();
        let mut expected = 0;

        for handle in &self.workers {
            if handle
                .wref
                .send(WorkerMsg::Shutdown {
                    mode,
                    ack: ack_tx.clone(),
                })
                .is_ok()
            {
                expected += 1;
            }
        }

        drop(ack_tx);

        for _ in 0..expected {
            if ack_rx.recv_timeout(ACK_TIMEOUT).is_err() {
                logging::warn!(self.log, "worker shutdown ack timed out";
                               "context" => "shutdown");
                break;
            }
        }

        for handle in self.workers.drain(..) {
            let _ = handle.thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolViolation;
    use crate::connection::ConnectionId;
    use crate::handler::{ConnectionCtx, Delegator};
    use crate::server::test_support::server_stub;
    use crate::worker::WorkerRef;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    struct Sink;

    impl crate::handler::StreamHandler for Sink {
        fn data(
            &mut self,
            _input: &[u8],
            _ctx: &mut ConnectionCtx<'_>,
        ) -> Result<(), ProtocolViolation> {
            Ok(())
        }
    }

    struct TrackingDelegator {
        worker: WorkerId,
        accepted_on: Arc<Mutex<Vec<WorkerId>>>,
        broadcasts: Arc<AtomicUsize>,
    }

    impl Delegator for TrackingDelegator {
        fn accept_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn StreamHandler>> {
            self.accepted_on.lock().unwrap().push(self.worker);
            Some(Box::new(Sink))
        }

        fn handle_broadcast(&mut self, _message: &Broadcast) {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        handle: ManagerHandle,
        server: ServerRef,
        accepted_on: Arc<Mutex<Vec<WorkerId>>>,
        broadcasts: Arc<AtomicUsize>,
    }

    fn fixture(num_workers: usize) -> Fixture {
        let log = flint::logging::discard();
        let handle = spawn(num_workers, &log).unwrap();

        let (server, _server_rx) = server_stub("pool-test", None);

        let accepted_on = Arc::new(Mutex::new(Vec::new()));
        let broadcasts = Arc::new(AtomicUsize::new(0));

        let accepted_in = accepted_on.clone();
        let broadcasts_in = broadcasts.clone();

        let factory = Arc::new(move |_server: ServerRef, worker: WorkerRef| {
            Box::new(TrackingDelegator {
                worker: worker.id(),
                accepted_on: accepted_in.clone(),
                broadcasts: broadcasts_in.clone(),
            }) as Box<dyn Delegator>
        });

        handle
            .mref
            .send(ManagerMsg::RegisterServer {
                server: server.clone(),
                factory,
            })
            .unwrap();

        Fixture {
            handle,
            server,
            accepted_on,
            broadcasts,
        }
    }

    fn assign_one(fixture: &Fixture) -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        fixture
            .handle
            .mref
            .send(ManagerMsg::Assign {
                stream: TcpStream::from_std(accepted),
                server: fixture.server.clone(),
            })
            .unwrap();

        client
    }

    fn wait_for<F: FnMut() -> bool>(mut done: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);

        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_round_robin_assignment() {
        let fixture = fixture(2);

        let _c1 = assign_one(&fixture);
        let _c2 = assign_one(&fixture);

        wait_for(
            || fixture.accepted_on.lock().unwrap().len() == 2,
            "both assignments",
        );

        let mut on = fixture.accepted_on.lock().unwrap().clone();
        on.sort_unstable();
        assert_eq!(on, vec![0, 1]);
    }

    #[test]
    fn test_broadcast_fans_out_to_all_workers() {
        let fixture = fixture(3);

        fixture
            .handle
            .mref
            .send(ManagerMsg::Broadcast {
                server: fixture.server.server_id(),
                message: Arc::new(42u32),
            })
            .unwrap();

        wait_for(
            || fixture.broadcasts.load(Ordering::SeqCst) == 3,
            "broadcast fan-out",
        );
    }

    struct RecordingTask {
        received: Arc<Mutex<Vec<u32>>>,
    }

    impl Task for RecordingTask {
        fn receive(&mut self, message: TaskMessage) {
            if let Ok(value) = message.downcast::<u32>() {
                self.received.lock().unwrap().push(*value);
            }
        }
    }

    #[test]
    fn test_task_schedule_and_message_routing() {
        let fixture = fixture(2);
        let received = Arc::new(Mutex::new(Vec::new()));

        let (reply_tx, reply_rx) = unbounded();
        fixture
            .handle
            .mref
            .send(ManagerMsg::Schedule {
                task: Box::new(RecordingTask {
                    received: received.clone(),
                }),
                reply: reply_tx,
            })
            .unwrap();

        let proxy = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        proxy.send(Box::new(17u32)).unwrap();

        wait_for(|| !received.lock().unwrap().is_empty(), "task delivery");
        assert_eq!(received.lock().unwrap()[0], 17);
    }

    #[test]
    fn test_shutdown_acknowledges_and_joins() {
        let fixture = fixture(2);
        let (ack_tx, ack_rx) = unbounded();

        fixture
            .handle
            .mref
            .send(ManagerMsg::Shutdown {
                mode: ShutdownMode::Drain,
                ack: ack_tx,
            })
            .unwrap();

        ack_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        fixture.handle.thread.join().unwrap();
    }
}
