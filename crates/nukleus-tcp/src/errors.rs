//! Error taxonomy (spec category numbers noted for traceability in
//! DESIGN.md, not surfaced to callers).

use std::io;

use thiserror::Error;

use crate::messages::MessageError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("maxConnections must be greater than zero")]
    InvalidMaxConnections,
    #[error("windowSize must be greater than zero")]
    InvalidWindowSize,
    #[error("maxMessageLength must be greater than zero")]
    InvalidMaxMessageLength,
    #[error("{field} must be a power of two, got {value}")]
    CapacityNotPowerOfTwo { field: &'static str, value: usize },
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {0} not found")]
    NotFound(u64),
    #[error("a server route is already bound to {0}")]
    AlreadyBound(std::net::SocketAddr),
}

/// Errors surfaced by the worker's ring-buffer substrate boundary.
#[derive(Debug, Error)]
pub enum RingError {
    #[error(transparent)]
    Queue(#[from] nukleus_communication::QueueError),
    #[error("message codec error: {0}")]
    Codec(#[from] MessageError),
}

/// Top-level worker error. Only raised for conditions that make the whole
/// worker unable to continue (category 6, "Fatal", in the error taxonomy);
/// per-connection failures never propagate here.
#[derive(Debug, Error)]
pub enum TcpWorkerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("ring substrate error: {0}")]
    Ring(#[from] RingError),
}
