//! Conductor Stream - Control-Stream Core for Terminal Sessions
//!
//! This crate decodes the conductor protocol that a remote session
//! multiplexes into a terminal's escape-sequence stream, and schedules the
//! resulting tokens for execution under strict ordering, priority, and
//! backpressure rules.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Byte Sources (producers)                     │
//! │        pty reader · ssh channel · capture replay · tests         │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ raw chunks, any alignment
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                        PROTOCOL FRAMER                           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────────┐ │
//! │  │  Envelope    │──►│  transition  │──►│ ConductorParser /     │ │
//! │  │  scan (OSC)  │   │ (pure state) │   │ ConductorDecoder      │ │
//! │  └──────────────┘   └──────────────┘   └───────────┬───────────┘ │
//! └────────────────────────────────────────────────────┼─────────────┘
//!                                                      │ TokenBatch
//! ┌────────────────────────────────────────────────────┼─────────────┐
//! │                        SCHEDULER                   ▼             │
//! │  ┌──────────┐   ┌───────────────┐   ┌──────────────────────────┐ │
//! │  │ SlotPool │──►│ High │ Normal │──►│  executor thread         │ │
//! │  │ (Normal) │   │    lanes      │   │  Terminal::execute       │ │
//! │  └──────────┘   └───────────────┘   └────────────┬─────────────┘ │
//! │                                                  │ side effects  │
//! └──────────────────────────────────────────────────┼───────────────┘
//!                                                    ▼
//!                                          controlling thread
//! ```
//!
//! # Key Types
//!
//! - [`ConductorDecoder`]: buffered, resumable decoder from bytes to tokens
//! - [`ParserState`] and [`transition`]: the framer as a pure state machine
//! - [`Scheduler`]: thread-safe handle to the executor
//! - [`ExecutionContext`]: what tokens and tasks see while running
//! - [`StreamConfig`]: layered configuration (file, environment, overrides)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use conductor_stream::{
//!     ConductorDecoder, ConnectionId, Lane, NoopDelegate, Scheduler, StreamConfig, Token,
//!     TokenBatch,
//! };
//!
//! let config = StreamConfig::default();
//! let scheduler = Scheduler::new(my_terminal, Arc::new(NoopDelegate), &config.scheduler)?;
//! let mut decoder = ConductorDecoder::new(ConnectionId::new(), config.framer);
//!
//! for chunk in source {
//!     decoder.push(&chunk);
//!     let tokens: Vec<Token<Vec<u8>>> =
//!         decoder.drain_tokens().into_iter().map(Token::from).collect();
//!     scheduler.add_tokens(TokenBatch::new(tokens, chunk.len()), Lane::Normal)?;
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod framer;
pub mod scheduler;
pub mod token;

pub use config::{
    load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource, FramerConfig,
    SchedulerConfig, StreamConfig,
};
pub use error::{ProtocolViolation, SchedulerError};
pub use framer::{
    transition, ConductorDecoder, ConductorParser, HookOutcome, HookResult, OutputBuilder,
    ParserState,
};
pub use scheduler::{
    global_pause, BackpressureLevel, ExecutionContext, FlushUrgency, Lane, NoopDelegate,
    PauseToken, Scheduler, SchedulerDelegate, Terminal,
};
pub use token::{
    ConductorToken, ConnectionId, SessionId, Token, TokenBatch, AUTOPOLL_EOF_MARKER, AUTOPOLL_PID,
};
