//! Token Data Model
//!
//! Types shared by the framer (which produces tokens) and the scheduler
//! (which is the only place tokens are executed).
//!
//! # Ownership
//!
//! A [`TokenBatch`] is produced once by a decoder and consumed once by the
//! scheduler. It moves between threads by value; there is no shared access.
//! The batch keeps an internal cursor so execution can stop mid-batch (pause,
//! preemption, rollback) and later resume at exactly the same token.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pid used by the remote framer for autopoll output.
///
/// Output chunks carrying this pid get a synthetic end-of-stream marker
/// appended when decoded, see [`AUTOPOLL_EOF_MARKER`].
pub const AUTOPOLL_PID: i32 = -1000;

/// Marker appended to decoded autopoll output.
pub const AUTOPOLL_EOF_MARKER: &[u8] = b"\nEOF\n";

/// Identifier of a remote command session (`begin <id>` ... `end <id>`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier for one conductor connection
///
/// Appended to the handshake payload of the `Init` token so the terminal can
/// tell connections apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a new unique connection ID using a random 128-bit value
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(format!("conn_{}", hex::encode(bytes)))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A token produced by the conductor framer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConductorToken {
    /// Handshake line with the connection ID appended
    Init {
        /// Handshake payload followed by a space and the connection ID
        payload: String,
    },
    /// A remote command session started
    Begin {
        /// Session the following lines belong to
        session: SessionId,
    },
    /// One framed line of session output
    Line {
        /// Owning session
        session: SessionId,
        /// Line payload, without envelope
        payload: String,
    },
    /// A remote command session ended
    End {
        /// Session that ended
        session: SessionId,
        /// Everything after `end <id> ` (exit status and type)
        status: String,
    },
    /// Output captured from a remote process
    OutputChunk {
        /// Remote process id, or [`AUTOPOLL_PID`]
        pid: i32,
        /// Output channel (-1 for login shells)
        channel: i32,
        /// Conductor nesting depth
        depth: i32,
        /// Decoded output bytes
        data: Vec<u8>,
    },
    /// A remote process exited
    Terminate {
        /// Remote process id
        pid: i32,
        /// Exit code
        exit_code: i32,
    },
    /// The framer detached; following bytes are ordinary terminal data
    Unhook,
}

impl ConductorToken {
    /// Whether this token must bypass ordinary output ordering
    ///
    /// Terminations and unhooks are submitted on the high-priority lane so
    /// they are not stuck behind a backlog of output.
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Terminate { .. } | Self::Unhook)
    }
}

/// A token as seen by the scheduler
///
/// Conductor tokens are typed; every other token is an opaque value of the
/// surrounding terminal's token type `T`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token<T> {
    /// A token produced by the conductor framer
    Conductor(ConductorToken),
    /// An ordinary terminal token, passed through untouched
    Terminal(T),
}

impl<T> From<ConductorToken> for Token<T> {
    fn from(token: ConductorToken) -> Self {
        Self::Conductor(token)
    }
}

/// An ordered, move-only group of tokens plus the input length that produced them
pub struct TokenBatch<T> {
    tokens: Vec<Token<T>>,
    cursor: usize,
    byte_len: usize,
}

impl<T> TokenBatch<T> {
    /// Create a batch from tokens decoded out of `byte_len` bytes of input
    #[must_use]
    pub fn new(tokens: Vec<Token<T>>, byte_len: usize) -> Self {
        Self {
            tokens,
            cursor: 0,
            byte_len,
        }
    }

    /// Number of input bytes this batch was decoded from
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Total number of tokens, consumed or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the batch holds no tokens at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of tokens not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.cursor
    }

    /// Whether every token has been consumed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.tokens.len()
    }

    /// The next token to execute, if any
    #[must_use]
    pub fn current(&self) -> Option<&Token<T>> {
        self.tokens.get(self.cursor)
    }

    /// Mark the current token consumed
    ///
    /// # Panics
    ///
    /// Panics if the batch is already finished. Advancing past the end means
    /// the scheduler's bookkeeping is corrupt.
    pub fn advance(&mut self) {
        assert!(
            self.cursor < self.tokens.len(),
            "token batch cursor advanced past end ({} of {})",
            self.cursor,
            self.tokens.len()
        );
        self.cursor += 1;
    }
}

impl<T> fmt::Debug for TokenBatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBatch")
            .field("tokens", &self.tokens.len())
            .field("cursor", &self.cursor)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}
