//! Event-driven TCP server framework.
//!
//! A `system::IOSystem` owns a fixed pool of single-threaded `worker::Worker`
//! event loops behind a `manager::WorkerManager`. `server::Server` actors
//! accept connections, enforce a hard admission cap and a two-level
//! connection-volume watermark, and hand accepted sockets to Workers
//! round-robin. Per-connection application logic lives in
//! `handler::ConnectionHandler` implementations created by per-worker
//! `handler::Delegator`s, with wire protocols plugged in through the
//! `codec::Codec` contract. An HTTP/1.x codec ships as the worked example.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod codec;
pub mod connection;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod server;
pub mod system;
pub mod worker;

pub mod prelude;
