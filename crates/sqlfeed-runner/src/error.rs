use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel_closed: child process is no longer accepting input")]
    Closed,
    #[error("channel io error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid timing: {0}")]
    Timing(String),
    #[error("invalid child mode: {0}")]
    Mode(String),
    #[error("invalid unit marker '{pattern}': {source}")]
    Marker {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
