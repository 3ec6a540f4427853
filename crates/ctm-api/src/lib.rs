//! Library surface of ctm-api.
//!
//! `main.rs` wires this into a running service; tests compose the router
//! directly against in-memory parts.

pub mod api_types;
pub mod routes;
pub mod state;
