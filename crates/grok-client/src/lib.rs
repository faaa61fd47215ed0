//! Streaming translator for the grok conversation endpoint
//!
//! Opens one upstream exchange per call under a rotated session cookie,
//! decodes the newline-delimited JSON response body incrementally, and hands
//! each extracted token to the caller as soon as it arrives.
//!
//! Two delivery modes share one producer:
//! - [`GrokClient::stream`] returns a [`TokenStream`]: a single-pass token
//!   sequence plus a terminal error slot that carries at most one error.
//! - [`GrokClient::execute`] drains the stream into one string. On failure
//!   the text produced so far is returned inside [`PartialFailure`].
//!
//! Call lifecycle (see [`state`]):
//! `Idle -> CredentialAcquired -> RequestSent -> {StatusError | Streaming}
//! -> {Completed | Cancelled | StreamError}`.

pub mod client;
pub mod decoder;
pub mod error;
pub mod request;
pub mod state;
pub mod stream;

pub use client::{ClientConfig, GrokClient};
pub use decoder::{DecodeSkip, LineDecoder, decode_line};
pub use error::{Error, PartialFailure, Result};
pub use request::{DEFAULT_TIMEOUT, DEFAULT_UPSTREAM_URL, UpstreamRequest};
pub use state::{CallEvent, CallState};
pub use stream::TokenStream;
