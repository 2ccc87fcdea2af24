//! Adapters
//!
//! Inbound HTTP surfaces and outbound implementations of the domain ports.

pub mod inbound;
pub mod outbound;
