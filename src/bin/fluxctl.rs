//! `fluxctl` — the operator CLI that talks to a running broker over its
//! local API socket.
//!
//! The local UNIX-domain API socket itself is out of scope for this crate
//! (spec.md §1 lists "individual command-line utilities" as an external
//! collaborator with a defined interface only); this binary exists to
//! reserve the command surface the real utility would expose.

use clap::{Parser, Subcommand};

/// Command-line surface for interacting with a running `fluxbroker` rank.
#[derive(Parser)]
#[command(name = "fluxctl", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetches one or more keys from the KVS.
    Get {
        /// Keys to fetch.
        keys: Vec<String>,
    },
    /// Sets or unlinks keys in the KVS (`key=value`, or bare `key` to unlink).
    Put {
        /// `key=value` pairs, or a bare key to unlink it.
        entries: Vec<String>,
    },
    /// Materializes a named commit.
    Commit {
        /// The commit name.
        name: String,
    },
    /// Prints the current root reference.
    Getroot,
    /// Publishes an event on the broker's event channel.
    Publish {
        /// Event topic.
        topic: String,
        /// JSON payload.
        payload: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Get { .. }
        | Command::Put { .. }
        | Command::Commit { .. }
        | Command::Getroot
        | Command::Publish { .. } => {
            eprintln!("fluxctl: the local API socket this command talks to is out of scope for this build");
            std::process::exit(2);
        }
    }
}
