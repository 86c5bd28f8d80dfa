use crate::config::BeaconConfig;
use crate::service::{delegator_factory, BeaconState};
use clap::{App, Arg};
use crucible::prelude::IOSystem;
use flint::logging;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod config;
mod service;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

pub fn main() {
    let matches = App::new("Beacon Service")
        .version("1.0")
        .author("Crucible developers")
        .about("Runs the beacon HTTP status server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file; defaults are used when omitted"),
        )
        .get_matches();

    let config = match matches.value_of("CONFIG_FILE") {
        Some(path) => BeaconConfig::load(path),
        None => BeaconConfig::default(),
    };

    let logger = logging::init();

    logging::info!(logger, "starting beacon";
                   "system" => config.system.name.clone(),
                   "port" => config.server.port);

    let system = IOSystem::new(config.system_config(), &logger).expect("Error starting io system");

    let state = BeaconState::new();
    let server = system
        .attach_server(config.server_settings(), delegator_factory(state.clone()))
        .expect("Error attaching beacon server");

    logging::info!(logger, "beacon serving";
                   "server" => server.name().to_string(),
                   "workers" => system.num_workers());

    // Periodic announcement exercising the delegator broadcast path.
    loop {
        thread::sleep(ANNOUNCE_INTERVAL);

        server.delegator_broadcast(Arc::new(format!(
            "beacon uptime {}s, {} requests",
            state.uptime_secs(),
            state.requests()
        )));
    }
}
