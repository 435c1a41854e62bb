//! tollgate-abuse — escalating penalties for error-prone client traffic.
//!
//! The protocol decoder upstream classifies each request's outcome; this
//! crate only reacts to those signals. A client that keeps sending
//! protocol-invalid or error-flagged requests is first slowed down, then
//! delayed past the request timeout — slow failure discourages automated
//! flooding more effectively than fast, cheap rejection. Well-formed
//! requests from the same client, and all other clients, are unaffected.
//!
//! Per-client state lives in an LRU-bounded map keyed by client identity,
//! so an unbounded identity space cannot grow memory without bound.

pub mod penalty;

pub use penalty::{AbusePenaltyLimiter, PenaltyLevel, RequestOutcome};
