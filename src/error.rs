//! # Error Types Module
//!
//! Centralized error handling for the acquisition service.
//! Provides custom error types for each concern with proper context and error chaining.
//!
//! ## Error Types
//! - `ConnectionError`: device connect, channel setup and subscription failures
//! - `AcquisitionError`: begin/end acquisition failures
//! - `StorageError`: recording file write, close and finalize failures
//! - `ChannelError`: client messaging failures
//! - `ConfigError`: settings file I/O, parsing and validation errors
//!
//! ## Propagation
//! None of these reach the host. The service logs them and turns them into a
//! `CONNECTION_ERROR` message for the client or a lifecycle transition.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while connecting to and configuring the device
#[derive(Debug)]
pub enum ConnectionError {
    /// Device address is malformed
    InvalidAddress(String),
    /// Failed to open the link to the device
    Connect { address: String, reason: String },
    /// Device refused the active channel set
    ChannelSetup(String),
    /// Raw data subscription failed
    Subscribe(String),
    /// Failed to create Tokio runtime
    RuntimeCreation(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidAddress(address) => {
                write!(f, "Invalid device address: {}", address)
            }
            ConnectionError::Connect { address, reason } => {
                write!(f, "Failed to connect to device {}: {}", address, reason)
            }
            ConnectionError::ChannelSetup(reason) => {
                write!(f, "Failed to configure device channels: {}", reason)
            }
            ConnectionError::Subscribe(reason) => {
                write!(f, "Failed to subscribe to raw data: {}", reason)
            }
            ConnectionError::RuntimeCreation(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors raised when starting or ending an acquisition
#[derive(Debug)]
pub enum AcquisitionError {
    /// Device is not connected
    NotConnected,
    /// Device refused to begin acquisition
    Begin(String),
    /// Device failed to end acquisition cleanly
    End(String),
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionError::NotConnected => write!(f, "Device is not connected"),
            AcquisitionError::Begin(reason) => {
                write!(f, "Failed to begin acquisition: {}", reason)
            }
            AcquisitionError::End(reason) => write!(f, "Failed to end acquisition: {}", reason),
        }
    }
}

impl std::error::Error for AcquisitionError {}

/// Errors that can occur while persisting a recording
#[derive(Debug)]
pub enum StorageError {
    /// Failed to create the recording file
    Create { path: PathBuf, source: std::io::Error },
    /// Failed to append a frame
    Write(std::io::Error),
    /// A frame arrived after the writers were closed
    WritersClosed,
    /// Failed to flush and close the writers
    Close(std::io::Error),
    /// Failed to assemble the final recording
    Finalize { path: PathBuf, source: std::io::Error },
    /// Failed to compress the final recording
    Compress(std::io::Error),
    /// Failed to remove an abandoned recording
    Discard { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Create { path, source } => {
                write!(f, "Failed to create recording file {}: {}", path.display(), source)
            }
            StorageError::Write(e) => write!(f, "Failed to write frame: {}", e),
            StorageError::WritersClosed => write!(f, "Recording writers are already closed"),
            StorageError::Close(e) => write!(f, "Failed to close recording writers: {}", e),
            StorageError::Finalize { path, source } => {
                write!(f, "Failed to store recording {}: {}", path.display(), source)
            }
            StorageError::Compress(e) => write!(f, "Failed to compress recording: {}", e),
            StorageError::Discard { path, source } => {
                write!(f, "Failed to discard recording {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Create { source, .. } => Some(source),
            StorageError::Write(e) => Some(e),
            StorageError::WritersClosed => None,
            StorageError::Close(e) => Some(e),
            StorageError::Finalize { source, .. } => Some(source),
            StorageError::Compress(e) => Some(e),
            StorageError::Discard { source, .. } => Some(source),
        }
    }
}

/// Errors that can occur when messaging the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No client has registered yet
    NoClient,
    /// The client endpoint is gone
    Disconnected,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::NoClient => write!(f, "No client is registered"),
            ChannelError::Disconnected => write!(f, "Client is dead"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// Configuration values are inconsistent
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::Invalid(reason) => {
                write!(f, "Invalid configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::Connect {
            address: "00:07:80:4D:2E:76".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(err.to_string().contains("00:07:80:4D:2E:76"));
    }

    #[test]
    fn test_storage_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = StorageError::Write(io_err);
        assert!(err.source().is_some());
        assert!(StorageError::WritersClosed.source().is_none());
    }

    #[test]
    fn test_config_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }
}
