//! meshbench - Control-Plane Core Library
//!
//! This crate provides the pieces shared by the meshbench test sequencer and
//! the node managers it drives: the generated control-plane protocol,
//! configuration, error handling, and the node-manager client surface.

pub mod config;
pub mod error;
pub mod node;

/// Generated control-plane protocol types and service stubs.
pub mod proto {
    tonic::include_proto!("meshbench.control");
}

// Re-export commonly used types for convenience
pub use config::SequencerConfig;
pub use error::{ControlError, Result};
pub use node::{GrpcNodeConnector, GrpcNodeControl, NodeConnector, NodeControl};
