//! Clap option structs for the relay daemon and the client

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;

/// Relay daemon options; anything given here wins over the config file
#[derive(Clone, Debug, Parser)]
#[command(name = "faidsd", version, about = "FaIDS file relay daemon")]
pub struct DaemonOpts {
    /// Config file (TOML); created with defaults when missing
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to listen on
    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Verbose logging for this crate
    #[arg(long)]
    pub debug: bool,

    /// Also append log events to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "faids", version, about = "Send and receive files through a FaIDS relay")]
pub struct ClientOpts {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, short = 'u')]
    pub user: String,

    /// Falls back to FAIDS_PASSWORD, then a prompt
    #[arg(long)]
    pub password: Option<String>,

    /// Pin the relay certificate on first use instead of accepting any
    #[arg(long)]
    pub tofu: bool,

    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Show who is ready to receive
    List,
    /// Offer a file to a ready user and stream it once accepted
    Send { to: String, file: PathBuf },
    /// Wait for one incoming offer
    Receive {
        #[arg(long, default_value = "files/receive")]
        dir: PathBuf,
        /// Accept without prompting
        #[arg(long, short = 'y')]
        yes: bool,
    },
}
