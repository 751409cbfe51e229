//! HTTP surface of the feedsync engine.
//!
//! The binary in `main.rs` wires config, storage and the scheduler; this
//! library holds the router and handlers so they can be driven in tests.

pub mod api;
pub mod db;
pub mod router;
pub mod state;
