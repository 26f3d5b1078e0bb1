//! Error types for the AutoConv daemon.
//!
//! This module defines custom error enums for each component of the daemon,
//! providing descriptive error messages with context information.

use thiserror::Error;

/// Errors related to the shared memory segment carrying per-frame depth samples.
#[derive(Error, Debug)]
pub enum ShmError {
    #[error("Failed to open shared memory segment '{name}': {source}")]
    OpenFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to map shared memory: {0}")]
    MmapFailed(std::io::Error),

    #[error("Invalid data read from shared memory: {0}")]
    InvalidData(String),

    #[error("Frame segment not available, the injection host may not be running")]
    NotAvailable,
}

/// Errors related to the convergence output and OSD segments.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to create shared memory segment '{name}': {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to size shared memory segment: {0}")]
    TruncateFailed(std::io::Error),

    #[error("Failed to map shared memory: {0}")]
    MmapFailed(std::io::Error),

    #[error("Stereo output sink not available on this platform")]
    NotAvailable,
}

/// Errors related to per-title profile management.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to load profiles: {0}")]
    LoadFailed(String),

    #[error("Failed to save profiles: {0}")]
    SaveFailed(String),

    #[error("Profile not found for app_id: {0}")]
    NotFound(String),
}

/// Errors related to IPC server operations.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to bind socket at '{path}': {source}")]
    SocketBindFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Client connection dropped unexpectedly")]
    ConnectionDropped,

    #[error("Invalid command received: {0}")]
    InvalidCommand(String),

    #[error("Failed to serialize response: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Top-level daemon errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("Stereo sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
