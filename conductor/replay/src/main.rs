//! Conductor Replay
//!
//! Replays a captured terminal byte stream through the conductor framer and
//! the priority scheduler, printing every executed token as one JSON line.
//!
//! # Usage
//!
//! ```bash
//! # Replay a capture in 512-byte chunks
//! conductor-replay --input session.cap --chunk-size 512
//!
//! # Resume mid-stream (no handshake line, lenient parsing)
//! conductor-replay --input tail.cap --recovery
//!
//! # Read from stdin with verbose logging
//! RUST_LOG=debug conductor-replay < session.cap
//! ```
//!
//! # Environment Variables
//!
//! - `CONDUCTOR_CONFIG`: Configuration file path
//! - `CONDUCTOR_BUFFER_DEPTH`, `CONDUCTOR_MAX_ENVELOPE`, `CONDUCTOR_MAX_OUTPUT`: limits
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! Logs go to stderr; stdout carries only JSON lines.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::signal;
use tokio::sync::{oneshot, Notify};
use tracing::{info, warn};

use conductor_stream::{
    load_config, load_config_from_path, ConductorDecoder, ConductorToken, ConfigOverrides,
    ConnectionId, ExecutionContext, Lane, Scheduler, SchedulerDelegate, StreamConfig, Terminal,
    Token, TokenBatch,
};

/// Side-effect flag raised when the framer detaches
const FLAG_UNHOOKED: u64 = 1;

/// Token type flowing through the replay scheduler
type ReplayToken = Token<Vec<u8>>;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "conductor-replay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Captured byte stream, or `-` for stdin
    #[arg(short = 'i', long, value_name = "FILE", default_value = "-")]
    input: PathBuf,

    /// Bytes fed to the decoder per chunk
    #[arg(short = 'n', long, value_name = "BYTES", default_value_t = 4096)]
    chunk_size: usize,

    /// Start after the handshake and skip unrecognized payloads
    #[arg(short = 'r', long)]
    recovery: bool,

    /// Connection ID appended to the handshake (random if omitted)
    #[arg(long, value_name = "ID")]
    connection_id: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "CONDUCTOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the number of in-flight normal batches
    #[arg(long, value_name = "N")]
    buffer_depth: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CONDUCTOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

// =============================================================================
// Terminal and delegate
// =============================================================================

/// One line of output
#[derive(Serialize)]
struct Record<'a> {
    seq: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    conductor: Option<&'a ConductorToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    passthrough: Option<String>,
}

/// Prints executed tokens as JSON lines
struct JsonLinesTerminal {
    executed: Arc<AtomicUsize>,
}

impl Terminal<Vec<u8>> for JsonLinesTerminal {
    fn execute(&mut self, token: &ReplayToken, context: &mut ExecutionContext<'_, Vec<u8>>) {
        let seq = self.executed.fetch_add(1, Ordering::SeqCst);
        let record = match token {
            Token::Conductor(token) => Record {
                seq,
                conductor: Some(token),
                passthrough: None,
            },
            Token::Terminal(bytes) => Record {
                seq,
                conductor: None,
                passthrough: Some(String::from_utf8_lossy(bytes).into_owned()),
            },
        };

        match serde_json::to_string(&record) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{line}") {
                    warn!(error = %e, "Failed to write record");
                }
            }
            Err(e) => warn!(error = %e, seq, "Failed to serialize record"),
        }

        match token {
            Token::Conductor(ConductorToken::Terminate { pid, exit_code }) => {
                let (pid, exit_code) = (*pid, *exit_code);
                context.add_side_effect(move || {
                    info!(pid, exit_code, "Remote process terminated");
                });
            }
            Token::Conductor(ConductorToken::Unhook) => {
                context.set_side_effect_flag(FLAG_UNHOOKED);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct ReplayDelegate {
    bytes: AtomicUsize,
    batches: AtomicUsize,
}

impl SchedulerDelegate for ReplayDelegate {
    fn did_execute(&self, byte_len: usize) {
        self.bytes.fetch_add(byte_len, Ordering::SeqCst);
        self.batches.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_side_effect_flags(&self, flags: u64) {
        if flags & FLAG_UNHOOKED != 0 {
            info!("Conductor detached; remaining bytes are plain terminal output");
        }
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Split decoded tokens into the normal batch and the urgent batch
fn partition(tokens: Vec<ConductorToken>) -> (Vec<ReplayToken>, Vec<ReplayToken>) {
    let (urgent, normal): (Vec<_>, Vec<_>) = tokens.into_iter().partition(ConductorToken::is_urgent);
    (
        normal.into_iter().map(Token::from).collect(),
        urgent.into_iter().map(Token::from).collect(),
    )
}

/// Counts reported at the end of a replay
#[derive(Debug, Default)]
struct Summary {
    chunks: usize,
    unhooked_at: Option<usize>,
}

async fn replay(
    scheduler: &Scheduler<Vec<u8>>,
    mut decoder: ConductorDecoder,
    input: &[u8],
    chunk_size: usize,
) -> Result<Summary> {
    let mut summary = Summary::default();

    for (index, chunk) in input.chunks(chunk_size.max(1)).enumerate() {
        summary.chunks += 1;

        if summary.unhooked_at.is_some() {
            let batch = TokenBatch::new(vec![Token::Terminal(chunk.to_vec())], chunk.len());
            scheduler.add_tokens_async(batch, Lane::Normal).await?;
            continue;
        }

        decoder.push(chunk);
        let (mut normal, urgent) = partition(decoder.drain_tokens());
        if decoder.is_unhooked() {
            if let Some(violation) = decoder.violation() {
                info!(chunk = index, reason = %violation, "Decoder unhooked");
            }
            summary.unhooked_at = Some(index);
            let rest = decoder.take_remaining();
            if !rest.is_empty() {
                normal.push(Token::Terminal(rest));
            }
        }

        scheduler
            .add_tokens_async(TokenBatch::new(normal, chunk.len()), Lane::Normal)
            .await?;
        if !urgent.is_empty() {
            scheduler
                .add_tokens_async(TokenBatch::new(urgent, 0), Lane::High)
                .await?;
        }
    }

    let (done_tx, done_rx) = oneshot::channel();
    scheduler.perform(move |_| {
        let _ = done_tx.send(());
    })?;
    done_rx.await.context("executor stopped before replay finished")?;

    Ok(summary)
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        return Ok(buf);
    }
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn load(args: &Args) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(Some(path))?,
        None => load_config()?,
    };
    let mut overrides = ConfigOverrides::new();
    if let Some(depth) = args.buffer_depth {
        overrides = overrides.with_buffer_depth(depth);
    }
    overrides.apply(&mut config)?;
    Ok(config)
}

/// Initialize logging on stderr
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "conductor_replay={level},conductor_stream={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = load(&args)?;
    info!(source = %config.source(), "Configuration loaded");

    let input = read_input(&args.input).await?;
    let connection_id = args
        .connection_id
        .clone()
        .map_or_else(ConnectionId::new, ConnectionId);
    let decoder = if args.recovery {
        ConductorDecoder::recovery(connection_id.clone(), config.framer)
    } else {
        ConductorDecoder::new(connection_id.clone(), config.framer)
    };
    info!(
        connection_id = %connection_id,
        bytes = input.len(),
        chunk_size = args.chunk_size,
        recovery = args.recovery,
        "Starting replay"
    );

    let executed = Arc::new(AtomicUsize::new(0));
    let delegate = Arc::new(ReplayDelegate::default());
    let terminal = JsonLinesTerminal {
        executed: Arc::clone(&executed),
    };
    let scheduler = Scheduler::new(terminal, delegate.clone(), &config.scheduler)?;

    let pending = Arc::new(Notify::new());
    let notifier = Arc::clone(&pending);
    // Replay has no periodic flush, so deferred requests are flushed right away too
    scheduler.set_flush_notifier(Some(Arc::new(move |_| notifier.notify_one())));

    let run = replay(&scheduler, decoder, &input, args.chunk_size);
    tokio::pin!(run);

    let summary = loop {
        tokio::select! {
            result = &mut run => break result?,
            () = pending.notified() => {
                scheduler.flush_side_effects();
            }
            _ = signal::ctrl_c() => {
                warn!("Interrupted, stopping replay");
                scheduler.shutdown();
                return Ok(());
            }
        }
    };
    scheduler.flush_side_effects();

    info!(
        chunks = summary.chunks,
        tokens = executed.load(Ordering::SeqCst),
        batches = delegate.batches.load(Ordering::SeqCst),
        bytes = delegate.bytes.load(Ordering::SeqCst),
        unhooked_at = ?summary.unhooked_at,
        "Replay complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_routes_urgent_tokens_high() {
        let tokens = vec![
            ConductorToken::Begin {
                session: "S1".into(),
            },
            ConductorToken::Terminate {
                pid: 4,
                exit_code: 0,
            },
            ConductorToken::Unhook,
        ];
        let (normal, urgent) = partition(tokens);
        assert_eq!(normal.len(), 1);
        assert_eq!(
            urgent,
            vec![
                Token::Conductor(ConductorToken::Terminate {
                    pid: 4,
                    exit_code: 0
                }),
                Token::Conductor(ConductorToken::Unhook),
            ]
        );
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["conductor-replay"]);
        assert_eq!(args.input, PathBuf::from("-"));
        assert_eq!(args.chunk_size, 4096);
        assert!(!args.recovery);
    }

    #[test]
    fn test_load_with_override() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[scheduler]\nbuffer_depth = 2\n").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = Args::parse_from(["conductor-replay", "--config", &path, "--buffer-depth", "7"]);
        let config = load(&args).unwrap();
        assert_eq!(config.scheduler.buffer_depth, 7);
    }
}
