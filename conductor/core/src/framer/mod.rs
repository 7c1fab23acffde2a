//! Conductor Protocol Framer
//!
//! Decodes the conductor protocol multiplexed into the terminal's escape
//! sequence stream.
//!
//! # Layers
//!
//! - [`envelope`]: classifies the bytes at the front of the input (OSC
//!   envelope, plain bytes, incomplete)
//! - [`state`]: the pure transition function over [`ParserState`]
//! - [`parser`]: [`ConductorParser`], the resumable hook with full backtrack
//! - [`decoder`]: [`ConductorDecoder`], a buffer for arbitrarily split chunks
//!
//! Nothing in this module touches threads, locks, or I/O.

pub mod decoder;
pub mod envelope;
pub mod parser;
pub mod state;

pub use decoder::ConductorDecoder;
pub use envelope::{encode, OSC_CONDUCTOR, OSC_CONDUCTOR_CONTROL};
pub use parser::{Checkpoint, ConductorParser, HookOutcome, HookResult};
pub use state::{transition, OutputBuilder, ParserState, Rules, Step, StepEvent};
