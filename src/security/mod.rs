//! Client identity.
//!
//! Resolves which address a request comes from and derives the opaque key
//! the rate limiter stores buckets under.

pub mod client_key;

pub use client_key::{client_ip, hash_client_key, normalize_key};
