//! kim - multi-process server runtime

mod cli;
mod theme;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use std::path::Path;
use tracing::Level;

use cli::{Cli, Commands, ConfigArgs, WorkerArgs};
use kim::config::{self, Config};
use kim::logging::{self, LogConfig};
use kim::module::registry;
use kim::process::spawn::EXIT_CHILD_INIT_FAIL;
use kim::process::{self, WorkerInit};
use theme::Themed;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::CheckConfig(args) => cmd_check_config(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::Worker(args) => cmd_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn load_config(args: &ConfigArgs) -> Result<(Config, std::path::PathBuf)> {
    let path = config::resolve_config_path(args.config.as_deref())?;
    let config = Config::load(&path)?;
    Ok((config, path))
}

/// Start the manager. Returns once every worker has stopped.
fn cmd_run(cli: &Cli, args: &ConfigArgs) -> Result<()> {
    let (config, path) = load_config(args)?;
    let work_dir = std::env::current_dir().context("cannot determine the working directory")?;

    let mut log = LogConfig::for_manager(&config, &work_dir);
    if cli.quiet {
        log = log.with_level(Level::ERROR);
    } else if cli.verbose >= 2 {
        log = log.with_level(Level::TRACE);
    } else if cli.verbose == 1 {
        log = log.with_level(Level::DEBUG);
    }
    logging::init(log.with_env_overrides());

    let stats = process::run_manager(config, &path)?;
    tracing::debug!(?stats, "final supervisor statistics");
    Ok(())
}

/// Validate a configuration and print what the server would run.
fn cmd_check_config(args: &ConfigArgs) -> Result<()> {
    let (config, path) = load_config(args)?;

    for module in &config.modules {
        let factory = registry::factory(&module.name).with_context(|| {
            format!(
                "module '{}' is not built in (available: {})",
                module.name,
                registry::catalogue_names().join(", ")
            )
        })?;
        factory(module).with_context(|| format!("module '{}' rejected its settings", module.name))?;
    }

    println!("{}", "Configuration".section_header());
    println!("{} {}", "File:".label(), path.display());
    println!("{} {}", "Server:".label(), config.server_name.name());
    println!("{} {}", "Workers:".label(), config.worker_cnt.count());
    println!(
        "{} {}",
        "Restart interval:".label(),
        format!("{} ms", config.restart_interval_ms).muted()
    );

    println!();
    println!("{}", "Modules".section_header());
    if config.modules.is_empty() {
        println!("  {}", "none".muted());
    }
    for module in &config.modules {
        println!("  {}", module.name.name());
    }

    println!();
    println!("{}", "Backends".section_header());
    if config.backends.is_empty() {
        println!("  {}", "none".muted());
    }
    for target in config.backend_targets() {
        println!(
            "  {} {} {}",
            target.name.name(),
            target.addr(),
            format!("(max {} connections)", target.max_conn_cnt).muted()
        );
    }

    println!();
    println!("{}", "Configuration is valid".success());
    Ok(())
}

/// Serve as a worker. Never returns.
fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    let init = match WorkerInit::from_arg(&args.init) {
        Ok(init) => init,
        Err(e) => {
            eprintln!("invalid worker descriptor: {}", e);
            std::process::exit(EXIT_CHILD_INIT_FAIL);
        }
    };
    process::run_worker_main(Path::new(&args.config), init)
}
