//! Error types for the privileged helper

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("Invalid interface name '{0}'")]
    InvalidInterface(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Interface {0} does not exist")]
    NoSuchInterface(String),

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unknown authorization group '{0}'")]
    UnknownGroup(String),

    #[error("Failed to look up credentials: {0}")]
    Credentials(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HelperError>;
