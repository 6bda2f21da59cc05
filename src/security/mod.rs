//! Security modules for the HTTP cache.
//!
//! Provides the host/IP access policy applied before any outbound call and
//! header sanitization applied before any header is replayed to a client.

pub mod access;
pub mod cidr;
pub mod sanitize;

pub use access::{AccessConfig, AccessDecision, AccessPolicy, DenyReason};
pub use cidr::CidrRange;
