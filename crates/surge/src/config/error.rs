use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write config.toml: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config.toml: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("failed to serialize config.toml: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
