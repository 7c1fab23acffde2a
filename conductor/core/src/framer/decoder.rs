//! Buffered Conductor Decoder
//!
//! Producers deliver byte chunks of arbitrary size with no alignment to token
//! boundaries. [`ConductorDecoder`] owns the buffer those chunks accumulate
//! in and feeds it to a [`ConductorParser`], dropping bytes only when the
//! parser reports them consumed.
//!
//! When the parser blocks, the decoder keeps the [`Checkpoint`] it reached,
//! so an open `%output` block or a long run of skipped bytes is scanned
//! once rather than once per chunk.
//!
//! ```text
//! push(chunk) ─► [ consumed | unparsed ............ ]
//!                            ▲ read_pos
//! next_token() ─► parser.handle(&buffer[read_pos..])
//! ```
//!
//! After an unhook the decoder yields one [`ConductorToken::Unhook`] and
//! then nothing; [`ConductorDecoder::take_remaining`] hands the unparsed
//! bytes to whatever handles ordinary terminal data.

use crate::config::FramerConfig;
use crate::error::ProtocolViolation;
use crate::token::{ConductorToken, ConnectionId};

use super::parser::{Checkpoint, ConductorParser, HookOutcome};

/// Minimum buffer capacity
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Incremental decoder from raw bytes to conductor tokens
#[derive(Debug)]
pub struct ConductorDecoder {
    parser: ConductorParser,
    buffer: Vec<u8>,
    read_pos: usize,
    checkpoint: Option<Checkpoint>,
    unhook_reported: bool,
}

impl ConductorDecoder {
    /// Create a decoder that expects the handshake line first
    #[must_use]
    pub fn new(connection_id: ConnectionId, limits: FramerConfig) -> Self {
        Self::from_parser(ConductorParser::new(connection_id, limits))
    }

    /// Create a decoder that resumes an already established connection
    #[must_use]
    pub fn recovery(connection_id: ConnectionId, limits: FramerConfig) -> Self {
        Self::from_parser(ConductorParser::recovery(connection_id, limits))
    }

    fn from_parser(parser: ConductorParser) -> Self {
        Self {
            parser,
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            checkpoint: None,
            unhook_reported: false,
        }
    }

    /// Push data into the decoder buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if needed
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get number of bytes not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Underlying parser
    #[must_use]
    pub fn parser(&self) -> &ConductorParser {
        &self.parser
    }

    /// Whether the parser has detached
    #[must_use]
    pub fn is_unhooked(&self) -> bool {
        self.parser.is_unhooked()
    }

    /// Why the parser detached, if it did
    #[must_use]
    pub fn violation(&self) -> Option<&ProtocolViolation> {
        self.parser.violation()
    }

    /// Decode the next token
    ///
    /// Returns `None` when more data is needed, or once the single
    /// `Unhook` token has been returned.
    pub fn next_token(&mut self) -> Option<ConductorToken> {
        if self.unhook_reported {
            return None;
        }

        let result = self
            .parser
            .resume(&self.buffer[self.read_pos..], &mut self.checkpoint);
        match result.outcome {
            HookOutcome::Token(token) => {
                self.read_pos += result.consumed;
                Some(token)
            }
            HookOutcome::Blocked => None,
            HookOutcome::Unhook(_) => {
                self.read_pos += result.consumed;
                self.unhook_reported = true;
                Some(ConductorToken::Unhook)
            }
        }
    }

    /// Decode every token currently available
    pub fn drain_tokens(&mut self) -> Vec<ConductorToken> {
        std::iter::from_fn(|| self.next_token()).collect()
    }

    /// Take the bytes the parser has not consumed
    ///
    /// Used after unhooking, when the rest of the stream is ordinary terminal
    /// data.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let rest = self.buffer.split_off(self.read_pos);
        self.buffer.clear();
        self.read_pos = 0;
        self.checkpoint = None;
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::envelope::encode;
    use crate::framer::state::ParserState;

    fn decoder() -> ConductorDecoder {
        ConductorDecoder::new(ConnectionId::from("conn_d"), FramerConfig::default())
    }

    #[test]
    fn test_decode_across_pushes() {
        let mut decoder = decoder();
        decoder.push(b"hand");
        assert_eq!(decoder.next_token(), None);
        decoder.push(b"shake\n");
        assert_eq!(
            decoder.next_token(),
            Some(ConductorToken::Init {
                payload: "handshake conn_d".to_string()
            })
        );
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_unhook_reported_once() {
        let mut decoder = decoder();
        decoder.push(b"hs\n");
        decoder.push(&encode(135, "unhook"));
        decoder.push(b"plain text");

        let tokens = decoder.drain_tokens();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1], ConductorToken::Unhook);
        assert_eq!(decoder.violation(), Some(&ProtocolViolation::Requested));
        assert_eq!(decoder.next_token(), None);
    }

    #[test]
    fn test_take_remaining_after_unhook() {
        let mut decoder = decoder();
        decoder.push(b"hs\n");
        decoder.push(&encode(134, "%terminate abc"));
        decoder.push(b"tail");
        decoder.drain_tokens();

        let mut expected = encode(134, "%terminate abc");
        expected.extend_from_slice(b"tail");
        assert_eq!(decoder.take_remaining(), expected);
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_open_output_block_is_scanned_once() {
        let mut decoder = decoder();
        decoder.push(b"hs\n");
        decoder.next_token();
        decoder.push(&encode(134, "%output X 3 1 0"));

        let chunk = vec![b'o'; 4096];
        for pushed in 1..=64 {
            decoder.push(&chunk);
            assert_eq!(decoder.next_token(), None);
            let checkpoint = decoder.checkpoint.as_ref().expect("checkpoint");
            assert_eq!(checkpoint.offset(), decoder.available());
            match checkpoint.state() {
                ParserState::OutputBuilder(builder) => {
                    assert_eq!(builder.raw().len(), pushed * chunk.len());
                }
                other => panic!("expected output builder, got {other:?}"),
            }
        }

        decoder.push(&encode(134, "%end X"));
        match decoder.next_token() {
            Some(ConductorToken::OutputChunk { pid, data, .. }) => {
                assert_eq!(pid, 3);
                assert_eq!(data.len(), 64 * chunk.len());
            }
            other => panic!("expected output chunk, got {other:?}"),
        }
        assert!(decoder.checkpoint.is_none());
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_compaction_keeps_unparsed_bytes() {
        let mut decoder = decoder();
        decoder.push(b"hs\n");
        decoder.next_token();

        let filler = vec![b'x'; MIN_BUFFER_CAPACITY * 2];
        decoder.push(&filler);
        decoder.push(&encode(134, "%terminate 1 0"));
        assert_eq!(
            decoder.next_token(),
            Some(ConductorToken::Terminate {
                pid: 1,
                exit_code: 0
            })
        );

        decoder.push(b"\x1b]134;%term");
        assert_eq!(decoder.next_token(), None);
        decoder.push(b"inate 2 1\x1b\\");
        assert_eq!(
            decoder.next_token(),
            Some(ConductorToken::Terminate {
                pid: 2,
                exit_code: 1
            })
        );
    }
}
