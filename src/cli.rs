// CLI Layer
// ユーザー入力の受付とコマンドルーティング

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Syncline - Heterogeneous Database Sync CLI
///
/// Synchronize data between databases running on different engines.
/// This tool performs the schema handshake: it verifies that the two
/// ends are structurally compatible before any rows move.
#[derive(Parser, Debug)]
#[command(name = "syncline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Heterogeneous database synchronization CLI tool")]
#[command(long_about = "Syncline - Heterogeneous Database Sync CLI

Synchronizes databases across engines (PostgreSQL, MySQL) by speaking a
versioned command protocol over a byte-stream pipe.

Syncline helps you:
  • Verify that two database schemas are structurally compatible
  • Get a precise diagnostic for the first mismatch found
  • Pin both ends to a consistent snapshot for the whole session

Supported databases: PostgreSQL, MySQL")]
#[command(propagate_version = true)]
#[command(after_help = "GETTING STARTED:
  1. Describe your environments in syncline.yaml
  2. Run the responder on the source side:   syncline serve --env production
  3. Pipe it to the receiver:                syncline sync --env staging

For detailed help on each command, use: syncline <command> --help")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the receiving end of a sync session
    ///
    /// Negotiates the protocol version, requests the peer's schema over
    /// standard input/output, and checks it against the local database.
    /// Exits non-zero with a diagnostic on the first structural mismatch.
    ///
    /// EXAMPLES:
    ///   # Check the staging environment against a piped responder
    ///   syncline serve --env production | syncline sync --env staging
    ///
    ///   # Restrict the comparison to specific tables
    ///   syncline sync --env staging --only users --only orders
    ///
    ///   # Join a snapshot the peer exported (same-server sync)
    ///   syncline sync --env staging --snapshot "00000003-0000004B-1"
    Sync {
        /// Environment to sync into (as named in syncline.yaml)
        #[arg(short, long, value_name = "ENV")]
        env: String,

        /// Table to exclude from the comparison (repeatable)
        #[arg(long, value_name = "TABLE")]
        ignore: Vec<String>,

        /// Restrict the comparison to this table (repeatable)
        #[arg(long, value_name = "TABLE")]
        only: Vec<String>,

        /// Join an existing snapshot instead of establishing one
        #[arg(long, value_name = "TOKEN")]
        snapshot: Option<String>,
    },

    /// Run the responding end of a sync session
    ///
    /// Answers protocol commands on standard input/output: version
    /// negotiation, schema requests in the negotiated format, and idle
    /// keep-alives. Stops on quit or when the peer closes the pipe.
    ///
    /// EXAMPLES:
    ///   # Serve the production environment over stdio
    ///   syncline serve --env production
    Serve {
        /// Environment to serve (as named in syncline.yaml)
        #[arg(short, long, value_name = "ENV")]
        env: String,
    },
}
