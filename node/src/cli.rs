//! # CLI Interface
//!
//! Defines the command-line argument structure for `chorus-node` using
//! `clap` derive. The only positional argument is the UDP peer port,
//! matching the habit of starting a node with nothing but a port number;
//! everything else hides behind flags with sensible defaults.

use clap::Parser;

/// Chorus oral-messaging peer node.
///
/// Joins the gossip fabric, keeps the shared five-slot word array, and
/// serves a line-oriented operator console over TCP.
#[derive(Parser, Debug)]
#[command(name = "chorus-node", about = "Chorus oral-messaging peer node", version)]
pub struct ChorusNodeCli {
    /// UDP port for peer traffic. Binds an ephemeral port when omitted.
    pub port: Option<u16>,

    /// TCP port for the operator console. Ephemeral when omitted.
    #[arg(long, env = "CHORUS_CONSOLE_PORT")]
    pub console_port: Option<u16>,

    /// IPv4 address other peers should use to reach this node.
    #[arg(long, env = "CHORUS_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Display name advertised in gossip announcements.
    #[arg(
        long,
        env = "CHORUS_NAME",
        default_value = chorus_protocol::config::DEFAULT_NODE_NAME
    )]
    pub name: String,

    /// When lying, send the fixed sentinel value instead of a random
    /// decoy per edge.
    #[arg(long)]
    pub sentinel_faults: bool,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, env = "CHORUS_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable output.
    #[arg(long)]
    pub log_json: bool,
}
