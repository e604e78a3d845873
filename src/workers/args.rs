//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::Config;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// LanShare - peer-to-peer LAN file sharing with resume and reconnect.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[serde(default)]
pub struct Args {
    /// Path to a config file (TOML).
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// TCP port for transfer sessions.
    #[clap(long)]
    pub tcp_port: Option<u16>,

    /// UDP port for peer discovery.
    #[clap(long)]
    pub udp_port: Option<u16>,

    /// Chunk size in bytes for new transfers.
    #[clap(long)]
    pub chunk_size: Option<u32>,

    /// Where received files land (state lives under .lan_share/ inside).
    #[clap(long)]
    pub download_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(skip)]
    pub verbose: u8,

    /// Dial a peer address on startup (pairing proceeds as usual).
    #[clap(long)]
    #[serde(skip)]
    pub connect: Option<SocketAddr>,

    /// Send this path once a peer is reachable. Requires --peer.
    #[clap(long)]
    #[serde(skip)]
    pub send: Option<PathBuf>,

    /// Target device id for --send.
    #[clap(long)]
    #[serde(skip)]
    pub peer: Option<String>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let cli_args = Args::parse();

        if let Some(config_path) = &cli_args.config {
            if let Some(file_args) = Self::from_file(config_path) {
                return Self::merge(file_args, cli_args);
            }
        }

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        toml::from_str::<Args>(&content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.tcp_port.is_some() {
            file.tcp_port = cli.tcp_port;
        }
        if cli.udp_port.is_some() {
            file.udp_port = cli.udp_port;
        }
        if cli.chunk_size.is_some() {
            file.chunk_size = cli.chunk_size;
        }
        if cli.download_dir.is_some() {
            file.download_dir = cli.download_dir;
        }
        file.verbose = cli.verbose;
        file.connect = cli.connect;
        file.send = cli.send;
        file.peer = cli.peer;
        file
    }

    /// Apply the overrides on top of the built-in defaults.
    pub fn to_config(&self) -> Config {
        let mut cfg = Config::default();
        if let Some(port) = self.tcp_port {
            cfg.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            cfg.udp_port = port;
            cfg.broadcast_addr = SocketAddr::from(([255, 255, 255, 255], port));
        }
        if let Some(size) = self.chunk_size {
            cfg.chunk_size = size;
        }
        if let Some(dir) = &self.download_dir {
            cfg.download_dir = dir.clone();
        }
        cfg
    }
}
