//! iptsync - declarative iptables rule management
//!
//! Reconciles the live iptables chains against a JSON file of desired rules.
//!
//! # Usage
//!
//! ```bash
//! iptsync parse                         # Current rules as JSON
//! iptsync parse --dump saved.v4         # Rules from a saved dump
//! iptsync plan rules.json               # Preview changes, host untouched
//! iptsync apply rules.json              # Reconcile the host
//! iptsync position "150 allow dns"      # Where a new rule would go
//! iptsync config --save                 # Write the effective config
//! iptsync history -n 50                 # Recent audit log entries
//! ```
//!
//! # Security
//!
//! - Runs as unprivileged user, elevates only for `iptables` calls
//! - All desired rules validated before any command runs
//! - Audit trail of every command sent to the host

use clap::{Parser, Subcommand};
use iptsync::audit::{AuditLog, AuditedExecutor};
use iptsync::config::{self, AppConfig};
use iptsync::core::error::IptablesErrorPattern;
use iptsync::core::exec::{DryRunExecutor, Executor, IptablesExecutor};
use iptsync::core::order::insert_position;
use iptsync::core::parser::parse_dump;
use iptsync::core::reconcile::Reconciler;
use iptsync::core::rule::Rule;
use iptsync::core::schema::FlagMap;
use iptsync::utils::truncate_string;
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;

shadow_rs::shadow!(build);

/// Longest command line shown in a plan before it is shortened
const MAX_COMMAND_DISPLAY: usize = 160;

#[derive(Parser)]
#[command(name = "iptsync", long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Declarative iptables rule manager", long_about = None)]
struct Cli {
    /// Config file to use instead of the XDG default
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the current rules and print them as JSON
    Parse {
        /// Read an iptables-save dump from a file instead of the host
        #[arg(short, long, value_name = "FILE")]
        dump: Option<PathBuf>,
    },
    /// Show the commands `apply` would run, without touching the host
    Plan {
        /// JSON file with the desired rules
        rules: PathBuf,
        /// Plan against a saved dump instead of the host
        #[arg(short, long, value_name = "FILE")]
        dump: Option<PathBuf>,
    },
    /// Reconcile the host against the desired rules
    Apply {
        /// JSON file with the desired rules
        rules: PathBuf,
    },
    /// Print the position a rule would be inserted at
    Position {
        /// Rule name, e.g. "150 allow dns"
        name: String,
        #[arg(short, long, default_value = "filter")]
        table: String,
        #[arg(short, long, default_value = "INPUT")]
        chain: String,
        /// Read an iptables-save dump from a file instead of the host
        #[arg(short, long, value_name = "FILE")]
        dump: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config {
        /// Write it to the XDG config directory
        #[arg(long)]
        save: bool,
    },
    /// Show recent audit log entries, newest first
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let _ = iptsync::utils::ensure_dirs();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

/// Prints an error, with hints for known `iptables` failures
fn report_error(e: &(dyn std::error::Error + 'static)) {
    if let Some(iptsync::Error::Iptables {
        message, stderr, ..
    }) = e.downcast_ref::<iptsync::Error>()
    {
        let translation = IptablesErrorPattern::match_error(stderr.as_deref().unwrap_or(message));
        eprintln!("Error: {}", translation.user_message);
        eprintln!("  {message}");
        for suggestion in &translation.suggestions {
            eprintln!("  hint: {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  see: {url}");
        }
    } else {
        eprintln!("Error: {e}");
    }
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => config::load_config_from(path).await?,
        None => config::load_config().await,
    };
    let schema = config.schema_config();

    match cli.command {
        Commands::Parse { dump } => {
            let dump = read_dump(dump.as_deref(), &config).await?;
            let rules = parse_dump(&dump, &FlagMap::new(&schema))?;
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
        Commands::Plan { rules, dump } => {
            let desired = load_rules(&rules).await?;
            let before = read_dump(dump.as_deref(), &config).await?;

            let reconciler = Reconciler::new(DryRunExecutor::new(&before), &schema);
            let results = reconciler.reconcile_all(desired).await?;

            for (name, change) in &results {
                println!("{name}: {change}");
            }

            let commands = reconciler.executor().commands();
            if commands.is_empty() {
                println!("\nNothing to do.");
                return Ok(());
            }

            println!("\nCommands:");
            for command in &commands {
                let line = format!("{} {}", config.iptables, command.join(" "));
                println!("  {}", truncate_string(&line, MAX_COMMAND_DISPLAY));
            }

            let after = reconciler.executor().dump();
            println!("\nResulting changes:");
            for change in TextDiff::from_lines(&before, &after).iter_all_changes() {
                let sign = match change.tag() {
                    ChangeTag::Delete => "-",
                    ChangeTag::Insert => "+",
                    ChangeTag::Equal => continue,
                };
                print!("{sign}{change}");
            }
        }
        Commands::Apply { rules } => {
            let desired = load_rules(&rules).await?;

            if !nix::unistd::getuid().is_root() {
                println!("Note: Not running as root. Will use run0/sudo/pkexec for iptables.");
            }

            let executor = AuditedExecutor::new(
                IptablesExecutor::new(&config),
                AuditLog::new()?,
                config.persist_path.clone(),
            );
            let reconciler = Reconciler::new(executor, &schema);
            let results = reconciler.reconcile_all(desired).await?;

            let mut changed = 0;
            for (name, change) in &results {
                if change.is_change() {
                    changed += 1;
                }
                println!("  {name}: {change}");
            }
            println!("✓ {changed} of {} rule(s) changed.", results.len());
        }
        Commands::Position {
            name,
            table,
            chain,
            dump,
        } => {
            let dump = read_dump(dump.as_deref(), &config).await?;
            let names: Vec<String> = parse_dump(&dump, &FlagMap::new(&schema))?
                .into_iter()
                .filter(|r| r.table == table && r.chain == chain)
                .map(|r| r.name)
                .collect();
            println!("{}", insert_position(&names, &name));
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config::save_config(&config).await?;
                println!("✓ Configuration saved.");
            }
        }
        Commands::History { count } => {
            let events = match AuditLog::new()?.read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            if events.is_empty() {
                println!("No audit entries.");
            }
            for event in events {
                let status = if event.success { "ok" } else { "FAILED" };
                println!(
                    "{} {:?} {status} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.details
                );
                if let Some(error) = event.error {
                    println!("    {error}");
                }
            }
        }
    }
    Ok(())
}

/// Reads a dump from `path`, or from the host when no path is given
async fn read_dump(path: Option<&Path>, config: &AppConfig) -> iptsync::Result<String> {
    match path {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => IptablesExecutor::new(config).save().await,
    }
}

async fn load_rules(path: &Path) -> iptsync::Result<Vec<Rule>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
