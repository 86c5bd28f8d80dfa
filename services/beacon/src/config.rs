use crucible::prelude::{IOSystemConfig, ServerSettings};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 28017;

#[derive(Serialize, Deserialize)]
pub struct System {
    pub name: String,
    pub workers: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub port: u16,
    pub max_connections: usize,
    /// Milliseconds; absent means connections never idle out under normal
    /// volume.
    pub max_idle_ms: Option<u64>,
    pub low_watermark: f64,
    pub high_watermark: f64,
    pub high_water_max_idle_ms: u64,
    pub tcp_backlog: Option<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct BeaconConfig {
    pub system: System,
    pub server: Server,
}

impl Default for BeaconConfig {
    fn default() -> BeaconConfig {
        BeaconConfig {
            system: System {
                name: "beacon".to_string(),
                workers: None,
            },
            server: Server {
                name: "beacon-http".to_string(),
                port: DEFAULT_PORT,
                max_connections: 1024,
                max_idle_ms: Some(30_000),
                low_watermark: 0.75,
                high_watermark: 0.85,
                high_water_max_idle_ms: 100,
                tcp_backlog: None,
            },
        }
    }
}

impl BeaconConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BeaconConfig {
        serdeconv::from_toml_file(path).expect("Error loading beacon configuration file")
    }

    pub fn system_config(&self) -> IOSystemConfig {
        IOSystemConfig {
            name: self.system.name.clone(),
            num_workers: self.system.workers,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            name: self.server.name.clone(),
            port: self.server.port,
            max_connections: self.server.max_connections,
            max_idle_time: self.server.max_idle_ms.map(Duration::from_millis),
            low_watermark: self.server.low_watermark,
            high_watermark: self.server.high_watermark,
            high_water_max_idle_time: Duration::from_millis(self.server.high_water_max_idle_ms),
            tcp_backlog_size: self.server.tcp_backlog,
            bind_attempt_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let toml = serdeconv::to_toml_string(&BeaconConfig::default()).unwrap();
        let parsed: BeaconConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(parsed.server.port, DEFAULT_PORT);
        assert_eq!(parsed.server.max_idle_ms, Some(30_000));
        assert!(parsed.server_settings().validate().is_ok());
    }
}
