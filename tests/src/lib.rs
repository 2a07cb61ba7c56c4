//! # Helix Test Suite
//!
//! Cross-subsystem integration flows over fully wired in-process nodes:
//!
//! ```text
//! tests/src/
//! ├── support.rs        # node fixture + loopback transport
//! └── integration/
//!     ├── dag_flows.rs        # propagation, ordering, dag sync
//!     ├── consensus_flows.rs  # finality, execution, slashing
//!     ├── network_flows.rs    # handshake, status, malicious peers
//!     └── pillar_flows.rs     # checkpoint certification
//! ```
//!
//! Run with `cargo test -p hx-tests`.

pub mod support;

#[cfg(test)]
mod integration {
    mod consensus_flows;
    mod dag_flows;
    mod network_flows;
    mod pillar_flows;
}
