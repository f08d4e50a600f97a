use channel_system::ChannelError;
use thiserror::Error;

/// Errors of the channel server process
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Internal error: {0}")]
    Internal(String),
}
