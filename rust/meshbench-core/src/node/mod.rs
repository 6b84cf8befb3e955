//! Node-manager control surface
//!
//! The client half of the control plane: how the sequencer reaches the node
//! managers it registered, plus helpers over the shared protocol types.

pub mod client;
pub mod protocol;

pub use client::{GrpcNodeConnector, GrpcNodeControl, NodeConnector, NodeControl};
