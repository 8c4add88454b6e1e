//! Command-line surface of the `airshare` binary

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "AirDrop-compatible file sharing over the local network")]
pub struct Args {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Display name shown to peers
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Transfer server port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Preferred network interface (repeatable)
    #[arg(long = "interface", global = true, action = ArgAction::Append)]
    pub interfaces: Vec<String>,

    /// Append transfer outcomes to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// More diagnostics (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print this device's id, name and certificate fingerprint
    Id,
    /// List peers on the network
    Discover {
        /// Seconds to browse before exiting
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Send files or directories to a peer
    Send {
        /// Peer id or display name
        #[arg(long)]
        to: String,
        /// Seconds to wait for the peer to appear
        #[arg(long, default_value_t = 15)]
        timeout: u64,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Become discoverable and accept incoming transfers
    Receive {
        /// Accept every request without prompting
        #[arg(long)]
        accept_all: bool,
        /// Where received files go (default: config download_dir, else the current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

impl Args {
    /// Fold command-line overrides into a loaded config.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(name) = &self.name {
            cfg.name = name.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if !self.interfaces.is_empty() {
            cfg.interfaces = self.interfaces.clone();
        }
        if let Command::Receive { dir: Some(dir), .. } = &self.command {
            cfg.download_dir = Some(dir.clone());
        }
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "airshare=info",
            1 => "airshare=debug",
            _ => "airshare=trace",
        }
    }
}
