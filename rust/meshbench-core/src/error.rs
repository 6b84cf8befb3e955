use std::net::SocketAddr;

use thiserror::Error;

/// Faults raised by the control-plane plumbing: configuration loading,
/// channel construction, and server lifecycle. Orchestration-level failures
/// travel as `tonic::Status` instead, since the status-code taxonomy is the
/// contract node managers and clients see on the wire.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid node endpoint '{address}'")]
    Endpoint {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("Failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {message}")]
    Serve {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, ControlError>;

// Convenience constructors
impl ControlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn endpoint(address: impl Into<String>, source: tonic::transport::Error) -> Self {
        Self::Endpoint {
            address: address.into(),
            source,
        }
    }

    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    pub fn serve(message: impl Into<String>) -> Self {
        Self::Serve {
            message: message.into(),
            source: None,
        }
    }

    pub fn serve_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serve {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
