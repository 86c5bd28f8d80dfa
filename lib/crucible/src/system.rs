//! IOSystem: the root handle tying a Worker pool, a metrics registry and
//! the attached Servers together.
//!
//! Multiple IOSystems may coexist in one process; nothing here is global.

use crate::handler::{DelegatorFactory, StreamHandler, Task};
use crate::manager::{self, ManagerHandle, ManagerMsg, TaskProxy};
use crate::metrics::Metrics;
use crate::server::{self, ConfigError, ServerRef, ServerSettings};
use crate::worker::ShutdownMode;
use crossbeam_channel::unbounded;
use flint::logging::{self, Logger};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct IOSystemConfig {
    pub name: String,
    /// Worker count; `None` uses the hardware parallelism.
    pub num_workers: Option<usize>,
}

impl Default for IOSystemConfig {
    fn default() -> IOSystemConfig {
        IOSystemConfig {
            name: "iosystem".to_string(),
            num_workers: None,
        }
    }
}

pub struct IOSystem {
    name: String,
    num_workers: usize,
    manager: ManagerHandle,
    metrics: Arc<Metrics>,
    servers: Mutex<Vec<(ServerRef, JoinHandle<()>)>>,
    next_server: AtomicU64,
    log: Logger,
}

impl IOSystem {
    /// Builds the Worker pool and the Manager. Pass a logger to get
    /// structured output; `None` runs silent.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: IOSystemConfig,
        log: L,
    ) -> io::Result<IOSystem> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("iosystem" => config.name.clone())),
            None => logging::discard(),
        };

        let num_workers = match config.num_workers {
            Some(count) => count,
            None => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };

        if num_workers == 0 {
            logging::warn!(log, "io system has no workers and cannot host connections";
                           "context" => "new");
        }

        let manager = manager::spawn(num_workers, &log)?;

        logging::info!(log, "io system started";
                       "context" => "new",
                       "workers" => num_workers);

        Ok(IOSystem {
            name: config.name.clone(),
            num_workers,
            manager,
            metrics: Metrics::new(&config.name),
            servers: Mutex::new(Vec::new()),
            next_server: AtomicU64::new(1),
            log,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Validates `settings`, spawns the Server actor and registers it with
    /// the Worker pool.
    pub fn attach_server(
        &self,
        settings: ServerSettings,
        factory: Arc<dyn DelegatorFactory>,
    ) -> Result<ServerRef, ConfigError> {
        let id = self.next_server.fetch_add(1, Ordering::Relaxed);

        let (sref, thread) = server::spawn(
            id,
            settings,
            self.manager.mref.clone(),
            &self.metrics,
            factory,
            &self.log,
        )?;

        self.servers
            .lock()
            .expect("IOSystem server list poisoned")
            .push((sref.clone(), thread));

        Ok(sref)
    }

    /// Initiates an outbound connection, bound round-robin to a Worker like
    /// any accepted socket. The handler's `connected` callback fires once
    /// the connect resolves.
    pub fn connect(&self, addr: SocketAddr, handler: Box<dyn StreamHandler>) -> Result<(), ()> {
        self.manager.mref.send(ManagerMsg::Connect { addr, handler })
    }

    /// Binds `task` to a Worker loop and returns its proxy.
    pub fn run(&self, task: Box<dyn Task>) -> Result<TaskProxy, ()> {
        let (reply_tx, reply_rx) = unbounded();

        self.manager.mref.send(ManagerMsg::Schedule {
            task,
            reply: reply_tx,
        })?;

        reply_rx.recv_timeout(SCHEDULE_TIMEOUT).map_err(|_| ())
    }

    /// Orderly teardown: Servers stop accepting and close (or drain) their
    /// connections, then the Worker pool shuts down and every thread is
    /// joined.
    pub fn shutdown(self, kill_connections: bool) {
        logging::info!(self.log, "io system shutting down";
                       "context" => "shutdown",
                       "kill" => kill_connections);

        let servers: Vec<(ServerRef, JoinHandle<()>)> = self
            .servers
            .lock()
            .expect("IOSystem server list poisoned")
            .drain(..)
            .collect();

        for (server, _) in &servers {
            server.shutdown(kill_connections);
        }

        for (_, thread) in servers {
            let _ = thread.join();
        }

        let mode = match kill_connections {
            true => ShutdownMode::Kill,
            false => ShutdownMode::Drain,
        };

        let (ack_tx, ack_rx) = unbounded();
        let _ = self.manager.mref.send(ManagerMsg::Shutdown { mode, ack: ack_tx });
        let _ = ack_rx.recv_timeout(SHUTDOWN_ACK_TIMEOUT);
        let _ = self.manager.thread.join();
    }

    /// Immediate teardown without drain: connections are dropped with no
    /// callbacks and nobody waits for stragglers.
    pub fn apocalypse(self) {
        logging::warn!(self.log, "apocalypse"; "context" => "apocalypse");

        let servers: Vec<(ServerRef, JoinHandle<()>)> = self
            .servers
            .lock()
            .expect("IOSystem server list poisoned")
            .drain(..)
            .collect();

        for (server, _) in &servers {
            server.shutdown(true);
        }

        let (ack_tx, ack_rx) = unbounded();
        let _ = self.manager.mref.send(ManagerMsg::Shutdown {
            mode: ShutdownMode::Kill,
            ack: ack_tx,
        });
        let _ = ack_rx.recv_timeout(Duration::from_secs(1));
    }
}
