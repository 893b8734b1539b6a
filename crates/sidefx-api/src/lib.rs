//! sidefx-api library target: router, shared state, and wire types.
//!
//! Exposed as a library so integration tests can drive the router
//! in-process, the way `main.rs` cannot (it also binds a TCP socket).

pub mod api_types;
pub mod routes;
pub mod state;
