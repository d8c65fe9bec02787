//! Tollgate - Edge Admission Control
//!
//! This crate decides, per inbound request, whether a client may proceed or
//! has exceeded its quota. A stateless fast path rejects clients holding a
//! signed over-limit marker; everything else goes to a quota engine that runs
//! a token-bucket or fixed-window policy against a shared state store using
//! conditional writes.

pub mod admission;
pub mod config;
pub mod edge;
pub mod error;
pub mod fastpath;
pub mod quota;
pub mod store;
