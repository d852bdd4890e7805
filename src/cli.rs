//! Command-line interface definitions for promptguard.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Endpoint DLP proxy for AI tools.
///
/// promptguard intercepts outbound AI-tool traffic on a managed endpoint,
/// inspects it for sensitive-data exposure, and applies the organization's
/// enforcement policy before forwarding. The default mode runs the
/// supervisor, which spawns and watches the interception engine.
#[derive(Parser, Debug)]
#[command(name = "promptguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (or omit for supervisor mode).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// Merged on top of the embedded defaults and the user config, giving it
    /// the highest priority.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the engine listening port.
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Override the workspace identifier.
    #[arg(short = 'w', long = "workspace", value_name = "ID")]
    pub workspace: Option<String>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Subcommands for promptguard.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Internal interception engine process (hidden).
    ///
    /// Spawned by the supervisor with configuration passed via environment
    /// variables. It should not be invoked directly by users.
    #[command(name = "internal-engine", hide = true)]
    InternalEngine,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_basic() {
        let cli = Cli::parse_from(["promptguard"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_parse_with_options() {
        let cli = Cli::parse_from([
            "promptguard",
            "-c",
            "/etc/promptguard.toml",
            "-p",
            "28080",
            "-w",
            "acme",
            "-vv",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/etc/promptguard.toml")));
        assert_eq!(cli.port, Some(28080));
        assert_eq!(cli.workspace, Some("acme".to_string()));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_internal_engine_command() {
        let cli = Cli::parse_from(["promptguard", "internal-engine"]);
        assert!(matches!(cli.command, Some(Commands::InternalEngine)));
    }
}
