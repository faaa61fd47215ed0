//! Round-robin cookie rotation and random user-agent selection

use std::sync::{Mutex, PoisonError};

use common::Secret;
use rand::RngExt;
use tracing::{debug, info};

/// User-agent sent when the identity pool is empty.
pub const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Credential rotator.
///
/// The pools are fixed at construction. The cursor is the only mutable state
/// and is guarded by a mutex so that the read of the current cookie and the
/// advance happen as one step: concurrent callers never observe the same
/// cursor value twice within a cycle.
pub struct Rotator {
    cookies: Vec<Secret<String>>,
    user_agents: Vec<String>,
    cursor: Mutex<usize>,
}

impl Rotator {
    pub fn new(cookies: Vec<Secret<String>>, user_agents: Vec<String>) -> Self {
        info!(
            cookies = cookies.len(),
            user_agents = user_agents.len(),
            "credential rotator initialized"
        );
        Self {
            cookies,
            user_agents,
            cursor: Mutex::new(0),
        }
    }

    /// Return the cookie at the cursor and advance the cursor by one,
    /// wrapping at the end of the pool. Empty pool returns an empty string.
    pub fn next_credential(&self) -> String {
        if self.cookies.is_empty() {
            return String::new();
        }

        // The guarded value is a plain index, so a poisoned lock still holds
        // a usable cursor.
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cursor;
        *cursor = (index + 1) % self.cookies.len();
        debug!(index, pool_size = self.cookies.len(), "cookie issued");

        self.cookies[index].expose().clone()
    }

    /// Uniformly chosen user-agent, or [`FALLBACK_USER_AGENT`] when the
    /// identity pool is empty.
    pub fn random_identity(&self) -> String {
        if self.user_agents.is_empty() {
            return FALLBACK_USER_AGENT.to_string();
        }
        let index = rand::rng().random_range(0..self.user_agents.len());
        self.user_agents[index].clone()
    }

    /// Number of cookies in the rotation pool.
    pub fn pool_size(&self) -> usize {
        self.cookies.len()
    }

    /// Index of the cookie the next call to [`Rotator::next_credential`] returns.
    pub fn current_cursor(&self) -> usize {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Rotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rotator")
            .field("pool_size", &self.pool_size())
            .field("user_agents", &self.user_agents.len())
            .field("cursor", &self.current_cursor())
            .finish()
    }
}
