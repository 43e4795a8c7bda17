//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, or `peerbeam.toml` when present)
//! - Merging CLI with file config (CLI takes precedence)

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerbeam::{SessionConfig, WireFormat};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "peerbeam.toml";

/// peerbeam - direct peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML file with session and transfer settings.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Append full logs to this file.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Create a session and send one file.
    Send {
        /// File to send.
        file: PathBuf,

        /// Session identifier. A random one is generated when omitted.
        #[clap(long)]
        session: Option<String>,

        /// Chunk size in bytes.
        #[clap(long)]
        chunk_size: Option<usize>,

        /// Send chunks as binary frames instead of JSON.
        #[clap(long)]
        binary: bool,
    },
    /// Join a session and write the received file to disk.
    Receive {
        /// Session identifier. A random one is generated when omitted.
        #[clap(long)]
        session: Option<String>,

        /// Directory for the received file.
        #[clap(short, long, default_value = ".")]
        output: PathBuf,
    },
}

impl Args {
    pub fn load() -> Self {
        Args::parse()
    }

    /// Session settings from the config file, with CLI flags applied on top.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let file = match &self.config {
            Some(path) => Some(path.clone()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };
        let base = match file {
            Some(path) => Self::from_file(&path)?,
            None => SessionConfig::default(),
        };
        Ok(self.merge(base))
    }

    fn from_file(path: &Path) -> anyhow::Result<SessionConfig> {
        SessionConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))
    }

    /// Merge file config with CLI args (CLI takes precedence).
    fn merge(&self, mut config: SessionConfig) -> SessionConfig {
        if let Command::Send {
            chunk_size, binary, ..
        } = &self.command
        {
            if let Some(size) = chunk_size {
                config.transfer.chunk_size = (*size).max(1);
            }
            if *binary {
                config.transfer.wire_format = WireFormat::Binary;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let args = Args::try_parse_from([
            "peerbeam", "-vv", "send", "a.bin", "--chunk-size", "4096", "--binary",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        match &args.command {
            Command::Send { file, session, .. } => {
                assert_eq!(file, &PathBuf::from("a.bin"));
                assert!(session.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let config = args.merge(SessionConfig::default());
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.transfer.wire_format, WireFormat::Binary);
    }

    #[test]
    fn test_parse_receive_defaults() {
        let args = Args::try_parse_from(["peerbeam", "receive", "--session", "abc"]).unwrap();
        match &args.command {
            Command::Receive { session, output } => {
                assert_eq!(session.as_deref(), Some("abc"));
                assert_eq!(output, &PathBuf::from("."));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        let config = args.merge(SessionConfig::default());
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = Args::try_parse_from([
            "peerbeam", "--config", "/nonexistent/peerbeam.toml", "receive",
        ])
        .unwrap();
        assert!(args.session_config().is_err());
    }
}
