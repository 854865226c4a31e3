use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("No path available from {from} to {to}")]
    NoPathAvailable { from: String, to: String },

    #[error("Failed to install routes toward {destination} after {attempts} attempts")]
    InstallationFailure {
        destination: String,
        attempts: u32,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Probe of {element} failed: {reason}")]
    ProbeFailed { element: String, reason: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Substrate error: {message}")]
    Substrate { message: String },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("Unknown element: {element}")]
    UnknownElement { element: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type FabricResult<T> = std::result::Result<T, FabricError>;
