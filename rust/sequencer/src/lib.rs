//! meshbench test sequencer.
//!
//! The control-plane service that runs declarative benchmark workloads
//! across a fleet of node managers: it registers nodes, places service
//! instances on them, and drives the configure / introduce / run-traffic
//! phases, one test sequence at a time.

mod fanout;
pub mod placement;
pub mod server;
pub mod service;
pub mod state;

pub use server::SequencerServer;
pub use state::SequencerState;
