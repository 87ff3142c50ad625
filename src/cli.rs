//! Command-line interface definitions using clap.

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Multi-process server: a manager keeping a pool of module-serving workers alive.
#[derive(Parser, Debug)]
#[command(name = "kim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the manager and its workers.
    Run(ConfigArgs),

    /// Load and validate a configuration file, then summarise it.
    CheckConfig(ConfigArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),

    /// Serve as a worker. Started by the manager, not by hand.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Location of the configuration file.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Configuration file (default: config.json in the working directory).
    #[arg(short, long, env = "KIM_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub config: PathBuf,

    /// Worker descriptor as JSON.
    #[arg(long)]
    pub init: String,
}

/// Arguments for shell completions.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "kim",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_config() {
        let cli = Cli::try_parse_from(["kim", "-v", "run", "--config", "/etc/kim.json"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.config, Some(PathBuf::from("/etc/kim.json"))),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_worker() {
        let cli = Cli::try_parse_from([
            "kim",
            "worker",
            "--config",
            "/srv/config.json",
            "--init",
            "{}",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Worker(ref w) if w.init == "{}"));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["kim", "-q", "-v", "check-config"]).is_err());
    }
}
