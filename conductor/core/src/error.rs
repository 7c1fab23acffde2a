//! Error Types
//!
//! The framer never fails in the `Result` sense: malformed input makes it
//! unhook, and [`ProtocolViolation`] records why. The scheduler only fails
//! when its executor is gone.

use thiserror::Error;

/// Why the conductor framer detached from a connection
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Handshake line was not valid UTF-8 or exceeded the envelope limit
    #[error("Malformed handshake line")]
    MalformedHandshake,

    /// `begin` without a session identifier
    #[error("Malformed begin header: {0:?}")]
    MalformedBegin(String),

    /// `%output`/`%autopoll` header with missing or non-numeric fields
    #[error("Malformed output header: {0:?}")]
    MalformedOutput(String),

    /// `%terminate` with missing or non-numeric fields
    #[error("Malformed terminate notification: {0:?}")]
    MalformedTerminate(String),

    /// Payload that no rule accepts in the current state
    #[error("Unrecognized payload on OSC {code}: {payload:?}")]
    UnrecognizedPayload {
        /// Envelope code
        code: u16,
        /// Payload text
        payload: String,
    },

    /// Bytes outside an envelope while inside a command body
    #[error("Unexpected bytes inside body of session {session}")]
    UnexpectedBytes {
        /// Session whose body was interrupted
        session: String,
    },

    /// An envelope grew beyond the configured limit without terminating
    #[error("Envelope exceeds {limit} bytes")]
    EnvelopeTooLarge {
        /// Configured limit
        limit: usize,
    },

    /// Accumulated `%output` data grew beyond the configured limit
    #[error("Output for {identifier} exceeds {limit} bytes")]
    OutputTooLarge {
        /// Output identifier
        identifier: String,
        /// Configured limit
        limit: usize,
    },

    /// The remote side asked the framer to detach
    #[error("Remote requested unhook")]
    Requested,
}

/// Errors returned by the scheduler handle
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The executor has stopped; the batch was dropped and its slot released
    #[error("Scheduler executor has shut down")]
    Shutdown,

    /// The executor thread could not be started
    #[error("Failed to spawn executor thread: {0}")]
    Spawn(#[from] std::io::Error),
}
