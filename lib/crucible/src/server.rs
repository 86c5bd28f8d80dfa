//! Server actor: owns the listening socket, enforces the admission cap and
//! drives the connection-volume watermark state machine.
//!
//! Status progression is `Initializing` (waiting for `WorkersReady`) →
//! `Binding` (bind with doubling backoff) → `Bound` (accept loop) →
//! `Terminated`. The open-connection invariant is enforced here: a socket
//! over `max_connections` is closed before anything downstream ever sees
//! it.

use crate::connection::{CloseCause, ConnectionId};
use crate::handler::{Broadcast, DelegatorFactory};
use crate::manager::{ManagerMsg, ManagerRef};
use crate::metrics::{Counter, Metrics, Rate};
use crate::worker::WorkerId;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use flint::logging::{self, Logger};
use hashbrown::HashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Socket, Type};
use std::error::Error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type ServerId = u64;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const INITIAL_BIND_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BIND_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_BACKLOG: u32 = 1024;
const EVENT_CAPACITY: usize = 64;

/// Coarse connection-volume indicator used to switch idle-timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Normal,
    HighWater,
}

/// Pure watermark transition function.
///
/// Boundaries are asymmetric (`>=` into high water, `<=` back out), so the
/// state is sticky anywhere inside the `(low, high)` band.
pub fn next_volume_state(
    current: VolumeState,
    open: usize,
    low_watermark: usize,
    high_watermark: usize,
) -> VolumeState {
    match current {
        VolumeState::Normal if open >= high_watermark => VolumeState::HighWater,
        VolumeState::HighWater if open <= low_watermark => VolumeState::Normal,
        unchanged => unchanged,
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub name: String,
    pub port: u16,
    pub max_connections: usize,
    /// `None` means connections never idle out under normal volume.
    pub max_idle_time: Option<Duration>,
    pub low_watermark: f64,
    pub high_watermark: f64,
    /// Idle bound applied while the server sits in `HighWater`.
    pub high_water_max_idle_time: Duration,
    pub tcp_backlog_size: Option<u32>,
    /// Bind retries before the server gives up. `None` retries forever.
    pub bind_attempt_limit: Option<u32>,
}

impl Default for ServerSettings {
    fn default() -> ServerSettings {
        ServerSettings {
            name: "server".to_string(),
            port: 0,
            max_connections: 1000,
            max_idle_time: None,
            low_watermark: 0.75,
            high_watermark: 0.85,
            high_water_max_idle_time: Duration::from_millis(100),
            tcp_backlog_size: None,
            bind_attempt_limit: None,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        for &(name, value) in &[
            ("low_watermark", self.low_watermark),
            ("high_watermark", self.high_watermark),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::WatermarkRange { name, value });
            }
        }

        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::WatermarkOrder {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }

        Ok(())
    }

    pub fn low_watermark_count(&self) -> usize {
        (self.low_watermark * self.max_connections as f64).floor() as usize
    }

    pub fn high_watermark_count(&self) -> usize {
        (self.high_watermark * self.max_connections as f64).floor() as usize
    }
}

/// Invalid configuration, detected synchronously at attach time.
#[derive(Debug)]
pub enum ConfigError {
    EmptyName,
    WatermarkRange { name: &'static str, value: f64 },
    WatermarkOrder { low: f64, high: f64 },
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyName => write!(f, "server name must not be empty"),
            ConfigError::WatermarkRange { name, value } => {
                write!(f, "{} must be within [0, 1], got {}", name, value)
            }
            ConfigError::WatermarkOrder { low, high } => write!(
                f,
                "low_watermark ({}) must not exceed high_watermark ({})",
                low, high
            ),
            ConfigError::Io(err) => write!(f, "io error during server setup: {}", err),
        }
    }
}

impl Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

pub(crate) enum ServerMsg {
    /// The Manager finished registering the delegator factory with every
    /// Worker.
    WorkersReady,
    /// A Worker took ownership of an assigned connection.
    ConnectionOpened { worker: WorkerId },
    ConnectionClosed {
        id: ConnectionId,
        worker: WorkerId,
        cause: CloseCause,
    },
    /// The Manager could not place an assigned connection on any Worker.
    AssignFailed,
    WorkerDead { worker: WorkerId },
    Shutdown { kill: bool },
}

/// Volume state and bound port, published by the Server loop and readable
/// from any thread without tearing.
struct SharedState {
    volume: AtomicU8,
    port: AtomicU32,
}

impl SharedState {
    fn new() -> SharedState {
        SharedState {
            volume: AtomicU8::new(0),
            port: AtomicU32::new(0),
        }
    }

    fn volume(&self) -> VolumeState {
        match self.volume.load(Ordering::Acquire) {
            0 => VolumeState::Normal,
            _ => VolumeState::HighWater,
        }
    }

    fn set_volume(&self, state: VolumeState) {
        let value = match state {
            VolumeState::Normal => 0,
            VolumeState::HighWater => 1,
        };

        self.volume.store(value, Ordering::Release);
    }

    fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port as u16),
        }
    }

    fn set_port(&self, port: u16) {
        self.port.store(u32::from(port), Ordering::Release);
    }
}

/// Cheap cloneable handle to a Server actor.
#[derive(Clone)]
pub struct ServerRef {
    id: ServerId,
    settings: Arc<ServerSettings>,
    shared: Arc<SharedState>,
    tx: Sender<ServerMsg>,
    waker: Arc<Waker>,
    manager: ManagerRef,
}

impl ServerRef {
    pub fn server_id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Current volume state. Readers may observe a value that is about to
    /// be superseded; idle-timeout decisions are eventually consistent with
    /// it.
    pub fn volume_state(&self) -> VolumeState {
        self.shared.volume()
    }

    /// Effective idle bound under the current volume state.
    pub fn max_idle_time(&self) -> Option<Duration> {
        match self.volume_state() {
            VolumeState::HighWater => Some(self.settings.high_water_max_idle_time),
            VolumeState::Normal => self.settings.max_idle_time,
        }
    }

    /// Port the listener is bound to, once `Bound` is reached. Useful with
    /// `port = 0` settings.
    pub fn local_port(&self) -> Option<u16> {
        self.shared.port()
    }

    /// Fans `message` out to this server's delegator on every Worker.
    pub fn delegator_broadcast(&self, message: Broadcast) {
        let _ = self.manager.send(ManagerMsg::Broadcast {
            server: self.id,
            message,
        });
    }

    /// Stops accepting and closes (`kill_connections`) or drains the
    /// server's connections.
    pub fn shutdown(&self, kill_connections: bool) {
        let _ = self.send(ServerMsg::Shutdown {
            kill: kill_connections,
        });
    }

    pub(crate) fn send(&self, message: ServerMsg) -> Result<(), ()> {
        self.tx.send(message).map_err(|_| ())?;
        let _ = self.waker.wake();
        Ok(())
    }
}

impl fmt::Debug for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRef")
            .field("id", &self.id)
            .field("name", &self.settings.name)
            .finish()
    }
}

/// Spawns the Server actor thread and registers it with the Manager. The
/// returned `ServerRef` is live immediately; binding happens asynchronously
/// once the Workers acknowledge the registration.
pub(crate) fn spawn(
    id: ServerId,
    settings: ServerSettings,
    manager: ManagerRef,
    metrics: &Arc<Metrics>,
    factory: Arc<dyn DelegatorFactory>,
    log: &Logger,
) -> Result<(ServerRef, thread::JoinHandle<()>), ConfigError> {
    settings.validate()?;

    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (tx, rx) = unbounded();

    let name = settings.name.clone();
    let settings = Arc::new(settings);
    let shared = Arc::new(SharedState::new());

    let sref = ServerRef {
        id,
        settings: settings.clone(),
        shared: shared.clone(),
        tx,
        waker,
        manager: manager.clone(),
    };

    let server = Server {
        id,
        settings,
        shared,
        poll,
        mailbox: rx,
        self_ref: sref.clone(),
        open: 0,
        per_worker: HashMap::new(),
        volume: VolumeState::Normal,
        connects: metrics.rate(&format!("{}.connects", name)),
        refused: metrics.rate(&format!("{}.refused", name)),
        closed: metrics.rate(&format!("{}.closed", name)),
        highwaters: metrics.rate(&format!("{}.highwaters", name)),
        connections: metrics.counter(&format!("{}.connections", name)),
        log: log.new(logging::o!("server" => name.clone())),
    };

    let thread = thread::Builder::new()
        .name(format!("server-{}", name))
        .spawn(move || server.run())
        .map_err(ConfigError::Io)?;

    let _ = manager.send(ManagerMsg::RegisterServer {
        server: sref.clone(),
        factory,
    });

    Ok((sref, thread))
}

struct Server {
    id: ServerId,
    settings: Arc<ServerSettings>,
    shared: Arc<SharedState>,
    poll: Poll,
    mailbox: Receiver<ServerMsg>,
    self_ref: ServerRef,
    open: usize,
    per_worker: HashMap<WorkerId, usize>,
    volume: VolumeState,
    connects: Arc<Rate>,
    refused: Arc<Rate>,
    closed: Arc<Rate>,
    highwaters: Arc<Rate>,
    connections: Arc<Counter>,
    log: Logger,
}

impl Server {
    fn run(mut self) {
        logging::debug!(self.log, "server initializing"; "context" => "run");

        // Initializing: wait for the Manager to finish fanning the
        // delegator factory out to the Workers.
        loop {
            match self.mailbox.recv() {
                Ok(ServerMsg::WorkersReady) => break,
                Ok(ServerMsg::Shutdown { kill }) => {
                    self.terminate(kill);
                    return;
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }

        let mut listener = match self.bind_with_backoff() {
            Some(listener) => listener,
            None => {
                self.terminate(true);
                return;
            }
        };

        if let Err(err) =
            self.poll
                .registry()
                .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        {
            logging::crit!(self.log, "listener registration failed";
                           "context" => "bind",
                           "error" => %err);
            self.terminate(true);
            return;
        }

        if let Ok(addr) = listener.local_addr() {
            self.shared.set_port(addr.port());
        }

        logging::info!(self.log, "server bound";
                       "context" => "bind",
                       "port" => self.shared.port().unwrap_or(0),
                       "max_connections" => self.settings.max_connections);

        let mut events = Events::with_capacity(EVENT_CAPACITY);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                logging::crit!(self.log, "server poll failed";
                               "context" => "run",
                               "error" => %err);
                self.terminate(true);
                return;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_ready(&listener);
                }
            }

            if let Some(kill) = self.drain_mailbox() {
                let _ = self.poll.registry().deregister(&mut listener);
                self.terminate(kill);
                return;
            }
        }
    }

    /// Attempts to bind with doubling backoff, staying responsive to
    /// shutdown. `None` means the server must terminate without binding.
    fn bind_with_backoff(&mut self) -> Option<TcpListener> {
        let mut backoff = INITIAL_BIND_BACKOFF;
        let mut attempts: u32 = 0;

        loop {
            match self.try_bind() {
                Ok(listener) => return Some(listener),
                Err(err) => {
                    attempts += 1;

                    logging::warn!(self.log, "bind failed";
                                   "context" => "bind",
                                   "port" => self.settings.port,
                                   "attempt" => attempts,
                                   "backoff_ms" => backoff.as_millis() as u64,
                                   "error" => %err);

                    if let Some(limit) = self.settings.bind_attempt_limit {
                        if attempts >= limit {
                            logging::crit!(self.log, "bind attempts exhausted";
                                           "context" => "bind",
                                           "port" => self.settings.port,
                                           "attempts" => attempts);
                            return None;
                        }
                    }

                    match self.mailbox.recv_timeout(backoff) {
                        Ok(ServerMsg::Shutdown { .. }) => return None,
                        Ok(_) => {}
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return None,
                    }

                    backoff = (backoff * 2).min(MAX_BIND_BACKOFF);
                }
            }
        }
    }

    fn try_bind(&self) -> io::Result<TcpListener> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.settings.port));
        let backlog = self.settings.tcp_backlog_size.unwrap_or(DEFAULT_BACKLOG);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        Ok(TcpListener::from_std(socket.into()))
    }

    /// Drains the accept queue. Admission is decided here, before any
    /// Worker sees the socket: over the cap means immediate close.
    fn accept_ready(&mut self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.connects.hit();

                    if self.open >= self.settings.max_connections {
                        self.refused.hit();

                        logging::debug!(self.log, "connection refused at admission";
                                        "context" => "accept",
                                        "peer" => %peer,
                                        "open" => self.open);
                        continue;
                    }

                    self.open += 1;
                    self.connections.increment();

                    let _ = stream.set_nodelay(true);

                    if self
                        .self_ref
                        .manager
                        .send(ManagerMsg::Assign {
                            stream,
                            server: self.self_ref.clone(),
                        })
                        .is_err()
                    {
                        // Manager is gone; undo the admission.
                        self.open -= 1;
                        self.connections.decrement();
                    }

                    self.update_volume();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed";
                                    "context" => "accept",
                                    "error" => %err);
                    return;
                }
            }
        }
    }

    /// Returns `Some(kill)` when a shutdown request arrived.
    fn drain_mailbox(&mut self) -> Option<bool> {
        while let Ok(message) = self.mailbox.try_recv() {
            match message {
                ServerMsg::WorkersReady => {}
                ServerMsg::ConnectionOpened { worker } => {
                    *self.per_worker.entry(worker).or_insert(0) += 1;
                }
                ServerMsg::ConnectionClosed { worker, cause, .. } => {
                    self.open = self.open.saturating_sub(1);
                    self.connections.decrement();

                    if let Some(count) = self.per_worker.get_mut(&worker) {
                        *count = count.saturating_sub(1);
                    }

                    self.closed.hit_tagged(&[("cause", cause.label())]);
                    self.update_volume();
                }
                ServerMsg::AssignFailed => {
                    self.open = self.open.saturating_sub(1);
                    self.connections.decrement();
                    self.update_volume();
                }
                ServerMsg::WorkerDead { worker } => {
                    let lost = self.per_worker.remove(&worker).unwrap_or(0);

                    if lost > 0 {
                        self.open = self.open.saturating_sub(lost);
                        self.connections.add(-(lost as i64));

                        for _ in 0..lost {
                            self.closed.hit_tagged(&[("cause", "worker_failure")]);
                        }

                        self.update_volume();
                    }

                    logging::error!(self.log, "worker died, in-flight connections lost";
                                    "context" => "worker_dead",
                                    "worker" => worker,
                                    "lost" => lost);
                }
                ServerMsg::Shutdown { kill } => return Some(kill),
            }
        }

        None
    }

    fn update_volume(&mut self) {
        let next = next_volume_state(
            self.volume,
            self.open,
            self.settings.low_watermark_count(),
            self.settings.high_watermark_count(),
        );

        if next == self.volume {
            return;
        }

        if next == VolumeState::HighWater {
            self.highwaters.hit();
        }

        logging::info!(self.log, "volume state changed";
                       "context" => "volume",
                       "from" => ?self.volume,
                       "to" => ?next,
                       "open" => self.open);

        self.volume = next;
        self.shared.set_volume(next);
    }

    fn terminate(&mut self, kill: bool) {
        let _ = self.self_ref.manager.send(ManagerMsg::UnregisterServer {
            server: self.id,
            kill,
        });

        logging::info!(self.log, "server terminated";
                       "context" => "shutdown",
                       "kill" => kill,
                       "open" => self.open);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// ServerRef wired to a bare mailbox, for Worker and Manager tests that
    /// need an owning server without a Server loop.
    pub(crate) fn server_stub(
        name: &str,
        max_idle: Option<Duration>,
    ) -> (ServerRef, Receiver<ServerMsg>) {
        let settings = ServerSettings {
            name: name.to_string(),
            max_idle_time: max_idle,
            ..ServerSettings::default()
        };

        let poll = Box::leak(Box::new(Poll::new().expect("Poll creation failed")));
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).expect("Waker creation failed");
        let (tx, rx) = unbounded();
        let (manager, _) = ManagerRef::test_ref();

        let sref = ServerRef {
            id: 1,
            settings: Arc::new(settings),
            shared: Arc::new(SharedState::new()),
            tx,
            waker: Arc::new(waker),
            manager,
        };

        (sref, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_transition_hysteresis() {
        // max_connections 10, low 0.5, high 0.8.
        let low = 5;
        let high = 8;
        let mut state = VolumeState::Normal;
        let mut highwaters = 0;

        let apply = |state: &mut VolumeState, open: usize, highwaters: &mut usize| {
            let next = next_volume_state(*state, open, low, high);
            if next == VolumeState::HighWater && *state == VolumeState::Normal {
                *highwaters += 1;
            }
            *state = next;
        };

        // Ramp up to 8: transitions to HighWater exactly at 8.
        for open in 1..=8 {
            apply(&mut state, open, &mut highwaters);
        }
        assert_eq!(state, VolumeState::HighWater);

        // Back into the band: sticky.
        apply(&mut state, 7, &mut highwaters);
        apply(&mut state, 6, &mut highwaters);
        assert_eq!(state, VolumeState::HighWater);

        // At the low mark: back to Normal.
        apply(&mut state, 5, &mut highwaters);
        assert_eq!(state, VolumeState::Normal);

        // Climb inside the band again without touching the high mark.
        apply(&mut state, 6, &mut highwaters);
        apply(&mut state, 7, &mut highwaters);
        assert_eq!(state, VolumeState::Normal);

        assert_eq!(highwaters, 1);
    }

    #[test]
    fn test_volume_boundaries_are_asymmetric() {
        assert_eq!(
            next_volume_state(VolumeState::Normal, 8, 5, 8),
            VolumeState::HighWater
        );
        assert_eq!(
            next_volume_state(VolumeState::Normal, 7, 5, 8),
            VolumeState::Normal
        );
        assert_eq!(
            next_volume_state(VolumeState::HighWater, 5, 5, 8),
            VolumeState::Normal
        );
        assert_eq!(
            next_volume_state(VolumeState::HighWater, 6, 5, 8),
            VolumeState::HighWater
        );
    }

    #[test]
    fn test_watermark_counts() {
        let settings = ServerSettings {
            max_connections: 10,
            low_watermark: 0.5,
            high_watermark: 0.8,
            ..ServerSettings::default()
        };

        assert_eq!(settings.low_watermark_count(), 5);
        assert_eq!(settings.high_watermark_count(), 8);
    }

    #[test]
    fn test_settings_validation() {
        assert!(ServerSettings::default().validate().is_ok());

        let bad_range = ServerSettings {
            high_watermark: 1.5,
            ..ServerSettings::default()
        };
        assert!(matches!(
            bad_range.validate(),
            Err(ConfigError::WatermarkRange { .. })
        ));

        let bad_order = ServerSettings {
            low_watermark: 0.9,
            high_watermark: 0.5,
            ..ServerSettings::default()
        };
        assert!(matches!(
            bad_order.validate(),
            Err(ConfigError::WatermarkOrder { .. })
        ));

        let bad_name = ServerSettings {
            name: String::new(),
            ..ServerSettings::default()
        };
        assert!(matches!(bad_name.validate(), Err(ConfigError::EmptyName)));
    }

    #[test]
    fn test_ref_idle_bound_follows_volume_state() {
        let (sref, _rx) = test_support::server_stub("idle", Some(Duration::from_secs(60)));

        assert_eq!(sref.max_idle_time(), Some(Duration::from_secs(60)));

        sref.shared.set_volume(VolumeState::HighWater);
        assert_eq!(
            sref.max_idle_time(),
            Some(sref.settings().high_water_max_idle_time)
        );

        sref.shared.set_volume(VolumeState::Normal);
        assert_eq!(sref.max_idle_time(), Some(Duration::from_secs(60)));
    }
}
