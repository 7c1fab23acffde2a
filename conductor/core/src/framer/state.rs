//! Framer State Machine
//!
//! The framer is a pure function of `(state, input)`. [`transition`] looks at
//! the front of the input, decides one step, and returns the next state with
//! the number of bytes that step accounts for. Nothing else is read or
//! written, so a caller can always retry from an earlier state.
//!
//! # States
//!
//! ```text
//!            handshake line
//!  Initial ─────────────────► Ground ◄──────────────────────────┐
//!                              │  │                              │
//!          begin <id>          │  │ %output / %autopoll          │
//!        ┌─────────────────────┘  └──────────────┐               │
//!        ▼                                       ▼               │
//!    Body(id) ── end <id> ... ──► Ground   OutputBuilder ── %end <id> ──┘
//! ```

use crate::config::FramerConfig;
use crate::error::ProtocolViolation;
use crate::token::{ConductorToken, ConnectionId, SessionId, AUTOPOLL_EOF_MARKER, AUTOPOLL_PID};

use super::envelope::{self, Envelope, Scan, OSC_CONDUCTOR, OSC_CONDUCTOR_CONTROL};

/// Accumulates one in-flight `%output`/`%autopoll` block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputBuilder {
    /// Remote process id, or [`AUTOPOLL_PID`]
    pub pid: i32,
    /// Output channel
    pub channel: i32,
    /// Conductor nesting depth
    pub depth: i32,
    /// Identifier named by the terminating `%end <identifier>`
    pub identifier: String,
    raw: Vec<u8>,
}

impl OutputBuilder {
    /// Start a builder for an ordinary process
    #[must_use]
    pub fn new(identifier: impl Into<String>, pid: i32, channel: i32, depth: i32) -> Self {
        Self {
            pid,
            channel,
            depth,
            identifier: identifier.into(),
            raw: Vec::new(),
        }
    }

    /// Start a builder for autopoll output
    #[must_use]
    pub fn autopoll(identifier: impl Into<String>) -> Self {
        Self::new(identifier, AUTOPOLL_PID, 0, 0)
    }

    /// Bytes accumulated so far
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn append(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    /// Produce the output token
    ///
    /// Autopoll output gets an end-of-stream marker appended; everything else
    /// is returned verbatim.
    #[must_use]
    pub fn decode(self) -> ConductorToken {
        let mut data = self.raw;
        if self.pid == AUTOPOLL_PID {
            data.extend_from_slice(AUTOPOLL_EOF_MARKER);
        }
        ConductorToken::OutputChunk {
            pid: self.pid,
            channel: self.channel,
            depth: self.depth,
            data,
        }
    }

    fn is_terminator(&self, env: &Envelope<'_>) -> bool {
        if env.code != Some(OSC_CONDUCTOR) {
            return false;
        }
        let text = env.text();
        let mut fields = text.split_whitespace();
        fields.next() == Some("%end") && fields.next() == Some(self.identifier.as_str())
    }
}

/// Which part of the protocol the framer is in
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for the handshake line
    Initial,
    /// Between frames; stray bytes are skipped
    Ground,
    /// Inside the body of a command session
    Body(SessionId),
    /// Collecting a `%output` block
    OutputBuilder(OutputBuilder),
}

/// Fixed inputs to the transition function for one connection
#[derive(Clone, Debug)]
pub struct Rules {
    /// Appended to the handshake payload
    pub connection_id: ConnectionId,
    /// Ignore unrecognized payloads in `Ground` instead of unhooking
    pub lenient: bool,
    /// Size limits
    pub limits: FramerConfig,
}

/// What one step produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepEvent {
    /// Bytes were accounted for without producing a token
    Progress,
    /// A token was produced
    Token(ConductorToken),
    /// The input ends inside an incomplete unit
    Blocked,
    /// The input cannot be parsed in this state
    Unhook(ProtocolViolation),
}

/// Result of one [`transition`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// State after the step
    pub state: ParserState,
    /// Bytes accounted for by the step (zero when blocked)
    pub consumed: usize,
    /// What the step produced
    pub event: StepEvent,
}

impl Step {
    fn progress(state: ParserState, consumed: usize) -> Self {
        Self {
            state,
            consumed,
            event: StepEvent::Progress,
        }
    }

    fn token(state: ParserState, consumed: usize, token: ConductorToken) -> Self {
        Self {
            state,
            consumed,
            event: StepEvent::Token(token),
        }
    }

    fn blocked(state: ParserState) -> Self {
        Self {
            state,
            consumed: 0,
            event: StepEvent::Blocked,
        }
    }

    fn unhook(consumed: usize, violation: ProtocolViolation) -> Self {
        Self {
            state: ParserState::Ground,
            consumed,
            event: StepEvent::Unhook(violation),
        }
    }
}

/// Take one step from `state` over the front of `input`
#[must_use]
pub fn transition(state: ParserState, input: &[u8], rules: &Rules) -> Step {
    match state {
        ParserState::Initial => initial(input, rules),
        ParserState::Ground => ground(input, rules),
        ParserState::Body(session) => body(session, input, rules),
        ParserState::OutputBuilder(builder) => output(builder, input, rules),
    }
}

fn initial(input: &[u8], rules: &Rules) -> Step {
    let Some(newline) = input.iter().position(|&b| b == b'\n') else {
        if input.len() > rules.limits.max_envelope_len {
            return Step::unhook(
                input.len(),
                ProtocolViolation::EnvelopeTooLarge {
                    limit: rules.limits.max_envelope_len,
                },
            );
        }
        return Step::blocked(ParserState::Initial);
    };

    let line = &input[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Ok(line) = std::str::from_utf8(line) else {
        return Step::unhook(newline + 1, ProtocolViolation::MalformedHandshake);
    };

    let payload = format!("{line} {}", rules.connection_id);
    Step::token(
        ParserState::Ground,
        newline + 1,
        ConductorToken::Init { payload },
    )
}

fn ground(input: &[u8], rules: &Rules) -> Step {
    let env = match envelope::scan(input, rules.limits.max_envelope_len) {
        Scan::Incomplete => return Step::blocked(ParserState::Ground),
        Scan::TooLarge => {
            return Step::unhook(
                input.len(),
                ProtocolViolation::EnvelopeTooLarge {
                    limit: rules.limits.max_envelope_len,
                },
            )
        }
        Scan::Other { len } => return Step::progress(ParserState::Ground, len),
        Scan::Envelope(env) if !env.is_conductor() => {
            return Step::progress(ParserState::Ground, env.len)
        }
        Scan::Envelope(env) => env,
    };

    let text = env.text();
    let fields: Vec<&str> = text.split_whitespace().collect();
    let code = env.code.unwrap_or_default();

    match (code, fields.first().copied()) {
        (_, Some("begin")) => match fields.get(1) {
            Some(id) => {
                let session = SessionId::new(*id);
                Step::token(
                    ParserState::Body(session.clone()),
                    env.len,
                    ConductorToken::Begin { session },
                )
            }
            None => Step::unhook(env.len, ProtocolViolation::MalformedBegin(text.clone())),
        },
        (OSC_CONDUCTOR_CONTROL, Some("unhook")) if fields.len() == 1 => {
            Step::unhook(env.len, ProtocolViolation::Requested)
        }
        (OSC_CONDUCTOR, Some("%output")) => match parse_output_header(&fields) {
            Some(builder) => Step::progress(ParserState::OutputBuilder(builder), env.len),
            None => Step::unhook(env.len, ProtocolViolation::MalformedOutput(text.clone())),
        },
        (OSC_CONDUCTOR, Some("%autopoll")) => match fields.get(1) {
            Some(id) => Step::progress(
                ParserState::OutputBuilder(OutputBuilder::autopoll(*id)),
                env.len,
            ),
            None => Step::unhook(env.len, ProtocolViolation::MalformedOutput(text.clone())),
        },
        (OSC_CONDUCTOR, Some("%terminate")) => match parse_terminate(&fields) {
            Some(token) => Step::token(ParserState::Ground, env.len, token),
            None => Step::unhook(env.len, ProtocolViolation::MalformedTerminate(text.clone())),
        },
        (OSC_CONDUCTOR, Some(word)) if word.starts_with('%') => {
            tracing::trace!(notification = %text, "Ignoring unrecognized notification");
            Step::progress(ParserState::Ground, env.len)
        }
        _ if rules.lenient => {
            tracing::debug!(code, payload = %text, "Recovery: ignoring unrecognized payload");
            Step::progress(ParserState::Ground, env.len)
        }
        _ => Step::unhook(
            env.len,
            ProtocolViolation::UnrecognizedPayload {
                code,
                payload: text,
            },
        ),
    }
}

fn body(session: SessionId, input: &[u8], rules: &Rules) -> Step {
    let env = match envelope::scan(input, rules.limits.max_envelope_len) {
        Scan::Incomplete => return Step::blocked(ParserState::Body(session)),
        Scan::TooLarge => {
            return Step::unhook(
                input.len(),
                ProtocolViolation::EnvelopeTooLarge {
                    limit: rules.limits.max_envelope_len,
                },
            )
        }
        Scan::Envelope(env) if env.is_conductor() => env,
        Scan::Envelope(Envelope { len, .. }) | Scan::Other { len } => {
            return Step::unhook(
                len,
                ProtocolViolation::UnexpectedBytes {
                    session: session.0,
                },
            )
        }
    };

    let text = env.text();
    let mut parts = text.splitn(3, ' ');
    if parts.next() == Some("end") && parts.next() == Some(session.as_str()) {
        let status = parts.next().unwrap_or_default().to_string();
        return Step::token(
            ParserState::Ground,
            env.len,
            ConductorToken::End { session, status },
        );
    }

    let token = ConductorToken::Line {
        session: session.clone(),
        payload: text,
    };
    Step::token(ParserState::Body(session), env.len, token)
}

fn output(mut builder: OutputBuilder, input: &[u8], rules: &Rules) -> Step {
    let len = match envelope::scan(input, rules.limits.max_envelope_len) {
        Scan::Incomplete => return Step::blocked(ParserState::OutputBuilder(builder)),
        Scan::TooLarge => {
            return Step::unhook(
                input.len(),
                ProtocolViolation::EnvelopeTooLarge {
                    limit: rules.limits.max_envelope_len,
                },
            )
        }
        Scan::Envelope(env) if builder.is_terminator(&env) => {
            return Step::token(ParserState::Ground, env.len, builder.decode());
        }
        Scan::Envelope(Envelope { len, .. }) | Scan::Other { len } => len,
    };

    if builder.raw.len() + len > rules.limits.max_output_len {
        return Step::unhook(
            len,
            ProtocolViolation::OutputTooLarge {
                identifier: builder.identifier,
                limit: rules.limits.max_output_len,
            },
        );
    }
    builder.append(&input[..len]);
    Step::progress(ParserState::OutputBuilder(builder), len)
}

/// `%output <id> <pid> <channel> <depth>`
fn parse_output_header(fields: &[&str]) -> Option<OutputBuilder> {
    if fields.len() < 5 {
        return None;
    }
    let pid = fields[2].parse().ok()?;
    let channel = fields[3].parse().ok()?;
    let depth = fields[4].parse().ok()?;
    Some(OutputBuilder::new(fields[1], pid, channel, depth))
}

/// `%terminate <pid> <rc>`
fn parse_terminate(fields: &[&str]) -> Option<ConductorToken> {
    if fields.len() < 3 {
        return None;
    }
    let pid = fields[1].parse().ok()?;
    let exit_code = fields[2].parse().ok()?;
    Some(ConductorToken::Terminate { pid, exit_code })
}
