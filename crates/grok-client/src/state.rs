//! Per-call state machine
//!
//! Pure transitions: the producer feeds events, the machine returns the next
//! state. Terminal states absorb every later event, which is what guarantees
//! a single terminal outcome per call when failures race.

/// States of one upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// A cookie and user-agent have been drawn from the rotator
    CredentialAcquired,
    /// The request is in flight, no response head yet
    RequestSent,
    /// Success status received, decoding the body
    Streaming { tokens: u64 },
    /// Body ended normally
    Completed { tokens: u64 },
    /// Caller cancelled or consumer went away
    Cancelled,
    /// Upstream answered with a non-success status
    StatusError { status: u16 },
    /// Request construction, transport, timeout or body read failure
    StreamError,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed { .. }
                | CallState::Cancelled
                | CallState::StatusError { .. }
                | CallState::StreamError
        )
    }

    /// Label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::CredentialAcquired => "credential_acquired",
            CallState::RequestSent => "request_sent",
            CallState::Streaming { .. } => "streaming",
            CallState::Completed { .. } => "completed",
            CallState::Cancelled => "cancelled",
            CallState::StatusError { .. } => "status_error",
            CallState::StreamError => "stream_error",
        }
    }
}

/// Events observed by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    CredentialIssued,
    RequestDispatched,
    /// Response head with a success status
    Accepted,
    /// Response head with a non-success status
    Rejected { status: u16 },
    /// One token handed to the consumer
    TokenDelivered,
    /// Body ended normally
    BodyEnded,
    Failed,
    Cancelled,
}

/// Apply one event. Pure function: no I/O.
pub fn transition(state: CallState, event: CallEvent) -> CallState {
    match (state, event) {
        // Terminal states are never left
        (state, _) if state.is_terminal() => state,

        (_, CallEvent::Cancelled) => CallState::Cancelled,
        (_, CallEvent::Failed) => CallState::StreamError,

        (CallState::Idle, CallEvent::CredentialIssued) => CallState::CredentialAcquired,
        (CallState::CredentialAcquired, CallEvent::RequestDispatched) => CallState::RequestSent,
        (CallState::RequestSent, CallEvent::Accepted) => CallState::Streaming { tokens: 0 },
        (CallState::RequestSent, CallEvent::Rejected { status }) => {
            CallState::StatusError { status }
        }
        (CallState::Streaming { tokens }, CallEvent::TokenDelivered) => {
            CallState::Streaming { tokens: tokens + 1 }
        }
        (CallState::Streaming { tokens }, CallEvent::BodyEnded) => CallState::Completed { tokens },

        // Invalid transition: stay in current state
        (state, _event) => state,
    }
}
