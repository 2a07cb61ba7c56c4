//! # Node Runtime
//!
//! Builds and runs a full node: configuration loading, database opening
//! (with the major-version rebuild cycle), state replay, subsystem
//! construction in dependency order, network injection, task spawning and
//! ordered shutdown.

pub mod config;
pub mod node;
pub mod transport;

pub use config::NodeConfig;
pub use node::Node;
