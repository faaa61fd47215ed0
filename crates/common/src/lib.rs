//! Shared types for the grok proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
