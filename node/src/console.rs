//! # Operator Console
//!
//! Line-oriented TCP adapter over the node's operator surface. Each
//! accepted connection gets a welcome line and then a command loop;
//! every command round-trips through the [`NodeHandle`], so the console
//! never touches node state directly.
//!
//! The command set is deliberately tiny: inspect peers and the word
//! array, initiate an agreement, and toggle fault injection.

use anyhow::Result;
use chorus_protocol::node::{NodeError, NodeHandle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Greeting sent to every new console client.
pub const WELCOME: &str =
    "Welcome to the chorus console. Commands: peers, current, consensus <idx> <word...>, lie [pct], truth, exit";

// ---------------------------------------------------------------------------
// Command Parsing
// ---------------------------------------------------------------------------

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// List known peers.
    Peers,
    /// Show the word array.
    Current,
    /// Initiate a root consensus on a slot.
    Consensus {
        /// Target slot.
        index: i64,
        /// The word, joined from the remaining tokens.
        value: String,
    },
    /// `consensus` with a non-numeric index.
    InvalidIndex,
    /// Enable fault injection at a percentage, clamped to `[0, 100]`.
    Lie {
        /// Requested rate in percent.
        pct: f64,
    },
    /// Disable fault injection.
    Truth,
    /// Close this connection.
    Exit,
    /// Anything unrecognized.
    Unknown,
    /// Blank line; ignored.
    Empty,
}

impl ConsoleCommand {
    /// Parses one console line. Never fails: unparseable input maps to
    /// [`ConsoleCommand::Unknown`] or [`ConsoleCommand::InvalidIndex`].
    pub fn parse(line: &str) -> Self {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Self::Empty;
        };
        match first.to_ascii_lowercase().as_str() {
            "peers" => Self::Peers,
            "current" => Self::Current,
            "consensus" if parts.len() >= 3 => match parts[1].parse::<i64>() {
                Ok(index) => Self::Consensus {
                    index,
                    value: parts[2..].join(" "),
                },
                Err(_) => Self::InvalidIndex,
            },
            "lie" => {
                let pct = parts
                    .get(1)
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .unwrap_or(100.0);
                Self::Lie {
                    pct: pct.clamp(0.0, 100.0),
                }
            }
            "truth" => Self::Truth,
            "exit" => Self::Exit,
            _ => Self::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accepts console clients until shutdown. Each connection runs in its
/// own task; a misbehaving client affects nobody else.
pub async fn serve(
    listener: TcpListener,
    handle: NodeHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "console client connected");
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_client(stream, handle).await {
                                debug!(%err, "console client closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "console accept failed"),
                }
            }
        }
    }
}

async fn serve_client(stream: TcpStream, handle: NodeHandle) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_line(&mut write_half, WELCOME).await?;

    while let Some(line) = lines.next_line().await? {
        let response = match ConsoleCommand::parse(&line) {
            ConsoleCommand::Empty => continue,
            ConsoleCommand::Peers => {
                let peers = handle.peers().await?;
                if peers.is_empty() {
                    "No peers known.".to_string()
                } else {
                    peers
                        .iter()
                        .map(|p| {
                            format!("{} (name={}, last_seen={:.1}s)", p.key, p.name, p.last_seen_secs)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            ConsoleCommand::Current => {
                let words = handle.current().await?;
                words
                    .iter()
                    .enumerate()
                    .map(|(i, word)| format!("[{}] {}", i, word))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            ConsoleCommand::Consensus { index, value } => {
                match handle.start_consensus(index, value).await {
                    Ok(()) => "Consensus started.".to_string(),
                    Err(NodeError::Consensus(_)) => "No peers known.".to_string(),
                    Err(err) => return Err(err.into()),
                }
            }
            ConsoleCommand::InvalidIndex => "Invalid index.".to_string(),
            ConsoleCommand::Lie { pct } => {
                let applied = handle.set_lying(pct / 100.0).await?;
                format!("Lying enabled at rate {:.0}%.", applied * 100.0)
            }
            ConsoleCommand::Truth => {
                handle.set_truthful().await?;
                "Lying disabled.".to_string()
            }
            ConsoleCommand::Exit => {
                write_line(&mut write_half, "Goodbye.").await?;
                return Ok(());
            }
            ConsoleCommand::Unknown => "Unknown command.".to_string(),
        };
        write_line(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
