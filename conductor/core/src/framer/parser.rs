//! Resumable Conductor Parser
//!
//! [`ConductorParser`] drives the pure [`transition`] function until a token
//! is produced or the input runs out. It only commits a new state when a
//! token is produced, so a call that ends in the middle of a unit leaves the
//! parser exactly as it was and reports zero bytes consumed. The caller keeps
//! those bytes and offers them again, extended, on the next call.
//!
//! A caller that keeps its own buffer can pass a [`Checkpoint`] back through
//! [`ConductorParser::resume`] so the retry starts where the blocked call
//! stopped instead of rescanning the retained bytes.
//!
//! # Unhooking
//!
//! A violation unhooks without consuming the offending unit, so everything
//! from it onwards belongs to the ordinary terminal parser. A requested
//! unhook consumes its own envelope. Once detached, every later call returns
//! [`HookOutcome::Unhook`] without consuming anything.

use crate::config::FramerConfig;
use crate::error::ProtocolViolation;
use crate::token::{ConductorToken, ConnectionId};

use super::state::{transition, ParserState, Rules, StepEvent};

/// What a call to [`ConductorParser::handle`] produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    /// One token was decoded
    Token(ConductorToken),
    /// More input is needed; nothing was consumed
    Blocked,
    /// The parser detached
    Unhook(ProtocolViolation),
}

/// Outcome plus the number of bytes the caller must drop from its buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookResult {
    /// What happened
    pub outcome: HookOutcome,
    /// Bytes consumed from the front of the input
    pub consumed: usize,
}

/// Where a blocked call got to before running out of input
///
/// Only valid for a later input that extends the one it was taken from.
/// [`ConductorParser::resume`] uses it to skip the work already done on the
/// prefix, such as the bytes of an open `%output` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    state: ParserState,
    offset: usize,
}

impl Checkpoint {
    /// Working state reached at `offset`
    #[must_use]
    pub fn state(&self) -> &ParserState {
        &self.state
    }

    /// Bytes of the input accounted for so far, none of them consumed
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Incremental parser for one conductor connection
#[derive(Debug)]
pub struct ConductorParser {
    state: ParserState,
    rules: Rules,
    violation: Option<ProtocolViolation>,
}

impl ConductorParser {
    /// Create a parser that expects the handshake line first
    #[must_use]
    pub fn new(connection_id: ConnectionId, limits: FramerConfig) -> Self {
        Self::with_state(ParserState::Initial, connection_id, limits, false)
    }

    /// Create a parser for a connection being recovered after a restart
    ///
    /// The handshake was already seen, so parsing starts in `Ground`, and
    /// payloads no rule accepts are skipped rather than unhooking.
    #[must_use]
    pub fn recovery(connection_id: ConnectionId, limits: FramerConfig) -> Self {
        Self::with_state(ParserState::Ground, connection_id, limits, true)
    }

    fn with_state(
        state: ParserState,
        connection_id: ConnectionId,
        limits: FramerConfig,
        lenient: bool,
    ) -> Self {
        Self {
            state,
            rules: Rules {
                connection_id,
                lenient,
                limits,
            },
            violation: None,
        }
    }

    /// Committed state
    #[must_use]
    pub fn state(&self) -> &ParserState {
        &self.state
    }

    /// Connection this parser belongs to
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.rules.connection_id
    }

    /// Whether the parser has detached
    #[must_use]
    pub fn is_unhooked(&self) -> bool {
        self.violation.is_some()
    }

    /// Why the parser detached, if it did
    #[must_use]
    pub fn violation(&self) -> Option<&ProtocolViolation> {
        self.violation.as_ref()
    }

    /// Decode at most one token from the front of `input`
    pub fn handle(&mut self, input: &[u8]) -> HookResult {
        self.run(input, None).0
    }

    /// Like [`handle`](Self::handle), continuing from `checkpoint`
    ///
    /// `input` must start with the bytes the checkpoint was taken over. The
    /// checkpoint is replaced when the call blocks again and cleared
    /// otherwise. The result is the same as calling `handle` on `input`.
    pub fn resume(&mut self, input: &[u8], checkpoint: &mut Option<Checkpoint>) -> HookResult {
        let start = checkpoint.take().filter(|c| c.offset <= input.len());
        let (result, next) = self.run(input, start);
        *checkpoint = next;
        result
    }

    fn run(
        &mut self,
        input: &[u8],
        start: Option<Checkpoint>,
    ) -> (HookResult, Option<Checkpoint>) {
        if let Some(violation) = &self.violation {
            let result = HookResult {
                outcome: HookOutcome::Unhook(violation.clone()),
                consumed: 0,
            };
            return (result, None);
        }

        let (mut working, mut offset) = match start {
            Some(Checkpoint { state, offset }) => (state, offset),
            None => (self.state.clone(), 0),
        };

        loop {
            if offset >= input.len() && offset > 0 {
                let checkpoint = Checkpoint {
                    state: working,
                    offset,
                };
                return (Self::blocked(), Some(checkpoint));
            }

            let step = transition(working, &input[offset..], &self.rules);
            match step.event {
                StepEvent::Progress => {
                    offset += step.consumed;
                    working = step.state;
                }
                StepEvent::Token(token) => {
                    self.state = step.state;
                    let result = HookResult {
                        outcome: HookOutcome::Token(token),
                        consumed: offset + step.consumed,
                    };
                    return (result, None);
                }
                StepEvent::Blocked => {
                    let checkpoint = Checkpoint {
                        state: step.state,
                        offset,
                    };
                    return (Self::blocked(), Some(checkpoint));
                }
                StepEvent::Unhook(violation) => {
                    // A requested unhook is itself a conductor frame; anything
                    // else leaves the offending bytes for the terminal.
                    let consumed = if violation == ProtocolViolation::Requested {
                        tracing::debug!(
                            connection_id = %self.rules.connection_id,
                            "Conductor unhook requested by remote"
                        );
                        offset + step.consumed
                    } else {
                        tracing::warn!(
                            connection_id = %self.rules.connection_id,
                            error = %violation,
                            "Conductor protocol violation, unhooking"
                        );
                        0
                    };
                    self.state = ParserState::Ground;
                    self.violation = Some(violation.clone());
                    let result = HookResult {
                        outcome: HookOutcome::Unhook(violation),
                        consumed,
                    };
                    return (result, None);
                }
            }
        }
    }

    fn blocked() -> HookResult {
        HookResult {
            outcome: HookOutcome::Blocked,
            consumed: 0,
        }
    }
}
