//! Session credential rotation for the grok upstream
//!
//! The upstream authenticates with browser session cookies rather than API
//! keys. Each upstream request draws the next cookie from an ordered pool in
//! round-robin order, plus one randomly chosen user-agent string from an
//! independent identity pool.
//!
//! Empty pools are not errors: an empty cookie pool yields an empty cookie
//! (the upstream rejects it with an auth status) and an empty identity pool
//! yields [`FALLBACK_USER_AGENT`].

pub mod rotator;

pub use rotator::{FALLBACK_USER_AGENT, Rotator};
