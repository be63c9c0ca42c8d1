use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "toolshed")]
#[command(about = "Community portal external-tools server and companion agent", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create the data directory, database schema, and a default tools
    /// configuration document.
    Init {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Run the HTTP server.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Request worker threads
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Master admin password (falls back to TOOLSHED_ADMIN_PASSWORD)
        #[arg(long)]
        admin_password: Option<String>,
    },

    /// Run the companion agent: poll the command queue and execute
    /// pending commands locally.
    Agent {
        /// Server base URL (host:port or full http(s) URL)
        #[arg(long)]
        server: String,
        #[arg(short, long)]
        username: String,
        #[arg(short = 'P', long)]
        password: String,
        /// Poll interval in seconds
        #[arg(long, default_value_t = 2)]
        poll_secs: u64,
        /// Backoff after a poll error in seconds
        #[arg(long, default_value_t = 5)]
        error_backoff_secs: u64,
    },

    /// Manage portal accounts.
    #[command(subcommand)]
    User(UserCommand),
}

#[derive(Subcommand)]
pub(crate) enum UserCommand {
    /// Create an account.
    Add {
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Enable external tools for this account
        #[arg(long)]
        external: bool,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// List accounts.
    List {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Enable or disable external tools for an account.
    SetExternal {
        username: String,
        /// on | off
        #[arg(value_parser = ["on", "off"])]
        state: String,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}
