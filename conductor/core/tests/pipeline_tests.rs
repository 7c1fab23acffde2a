//! End-to-end tests: configuration file, decoder, and scheduler together
//!
//! A capture is decoded in small chunks, urgent tokens are routed to the
//! high lane, and the executed order is checked against the stream order.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use conductor_stream::config::load_config_with_env;
use conductor_stream::framer::encode;
use conductor_stream::{
    ConductorDecoder, ConductorToken, ConnectionId, ExecutionContext, Lane, NoopDelegate,
    Scheduler, Terminal, Token, TokenBatch,
};

type Bytes = Vec<u8>;

#[derive(Clone, Default)]
struct Executed(Arc<Mutex<Vec<Token<Bytes>>>>);

impl Terminal<Bytes> for Executed {
    fn execute(&mut self, token: &Token<Bytes>, _context: &mut ExecutionContext<'_, Bytes>) {
        self.0.lock().push(token.clone());
    }
}

fn settle(scheduler: &Scheduler<Bytes>) {
    let (tx, rx) = mpsc::channel();
    scheduler
        .perform(move |_| {
            let _ = tx.send(());
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

fn capture() -> Bytes {
    let mut stream = b"hs\n".to_vec();
    stream.extend(encode(135, "begin S1"));
    stream.extend(encode(134, "first"));
    stream.extend(encode(134, "end S1 0"));
    stream.extend(encode(134, "%output P 9 1 0"));
    stream.extend_from_slice(b"payload");
    stream.extend(encode(134, "%end P"));
    stream.extend(encode(134, "%terminate 9 0"));
    stream.extend(encode(135, "unhook"));
    stream.extend_from_slice(b"$ ");
    stream
}

/// Decode `stream` in `chunk` sized pieces and feed the scheduler
fn feed(scheduler: &Scheduler<Bytes>, mut decoder: ConductorDecoder, stream: &[u8], chunk: usize) {
    for piece in stream.chunks(chunk) {
        if decoder.is_unhooked() {
            let batch = TokenBatch::new(vec![Token::Terminal(piece.to_vec())], piece.len());
            scheduler.add_tokens(batch, Lane::Normal).unwrap();
            continue;
        }
        decoder.push(piece);
        let mut tokens: Vec<Token<Bytes>> =
            decoder.drain_tokens().into_iter().map(Token::from).collect();
        if decoder.is_unhooked() {
            let rest = decoder.take_remaining();
            if !rest.is_empty() {
                tokens.push(Token::Terminal(rest));
            }
        }
        scheduler
            .add_tokens(TokenBatch::new(tokens, piece.len()), Lane::Normal)
            .unwrap();
    }
}

#[test]
fn test_config_file_drives_decoder_and_scheduler() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(
        file.path(),
        "[scheduler]\nbuffer_depth = 3\n\n[framer]\nmax_envelope_len = 256\n",
    )
    .unwrap();
    let config = load_config_with_env(Some(file.path()), |_| None).unwrap();
    assert_eq!(config.scheduler.buffer_depth, 3);
    assert_eq!(config.framer.max_envelope_len, 256);

    let executed = Executed::default();
    let scheduler =
        Scheduler::new(executed.clone(), Arc::new(NoopDelegate), &config.scheduler).unwrap();
    let decoder = ConductorDecoder::new(ConnectionId::from("conn_p"), config.framer);

    feed(&scheduler, decoder, &capture(), 5);
    settle(&scheduler);

    let conductor: Vec<ConductorToken> = executed
        .0
        .lock()
        .iter()
        .filter_map(|t| match t {
            Token::Conductor(token) => Some(token.clone()),
            Token::Terminal(_) => None,
        })
        .collect();
    assert_eq!(conductor.len(), 7);
    assert!(matches!(conductor[0], ConductorToken::Init { .. }));
    assert_eq!(
        conductor[4],
        ConductorToken::OutputChunk {
            pid: 9,
            channel: 1,
            depth: 0,
            data: b"payload".to_vec()
        }
    );
    assert_eq!(conductor[6], ConductorToken::Unhook);

    let passthrough: Bytes = executed
        .0
        .lock()
        .iter()
        .filter_map(|t| match t {
            Token::Terminal(bytes) => Some(bytes.clone()),
            Token::Conductor(_) => None,
        })
        .flatten()
        .collect();
    assert_eq!(passthrough, b"$ ".to_vec());
    assert_eq!(scheduler.available_slots(), 3);
}

#[test]
fn test_urgent_tokens_overtake_queued_output() {
    let executed = Executed::default();
    let config = load_config_with_env(None, |_| None).unwrap();
    let scheduler =
        Scheduler::new(executed.clone(), Arc::new(NoopDelegate), &config.scheduler).unwrap();
    let (gate_tx, gate_rx) = mpsc::channel();
    scheduler
        .perform(move |context| {
            let _ = gate_tx.send(context.pause());
        })
        .unwrap();
    let gate = gate_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(scheduler.is_paused());

    scheduler
        .add_tokens(
            TokenBatch::new(vec![Token::Terminal(b"bulk".to_vec())], 4),
            Lane::Normal,
        )
        .unwrap();
    scheduler
        .add_tokens(
            TokenBatch::new(vec![Token::Conductor(ConductorToken::Unhook)], 0),
            Lane::High,
        )
        .unwrap();
    drop(gate);
    settle(&scheduler);

    assert_eq!(
        executed.0.lock().clone(),
        vec![
            Token::Conductor(ConductorToken::Unhook),
            Token::Terminal(b"bulk".to_vec()),
        ]
    );
}
