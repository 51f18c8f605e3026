use error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use surge_core::ServerConfig;

pub mod error;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub server: ServerSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub address: String,
    pub timeout_ms: i64,
    pub heartbeat_interval_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    pub name: String,
    pub max_clients: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:9412".to_string(),
            timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "surge".to_string(),
            max_clients: 32,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            server: ServerSettings::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.network.address).is_err() {
            return Err(ConfigError::Validation(format!(
                "invalid network address '{}', expected 'IP:PORT'",
                self.network.address
            )));
        }
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Validation("server name cannot be empty".to_string()));
        }
        if self.server.max_clients == 0 {
            return Err(ConfigError::Validation("max_clients must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from_str(&self.network.address).expect("validated before use")
    }

    pub fn server_config(&self) -> ServerConfig {
        let mut server = ServerConfig::new(self.server.max_clients);
        server.peer.timeout_ms = self.network.timeout_ms;
        server.peer.heartbeat_interval_ms = self.network.heartbeat_interval_ms;
        server
    }
}

pub fn handle() -> Result<Config, ConfigError> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}
