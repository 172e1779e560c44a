use anyhow::Result;
use clap::{Parser, Subcommand};
use locator_core::profile::STORE_FILE;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "locator")]
#[command(about = "Blind offset discovery and replay for runtime structures")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print or save the built-in discovery plan
    Plan {
        /// Target pointer width in bits (32 or 64)
        #[arg(long, default_value_t = 64)]
        bits: u32,

        /// Write the plan to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build every variant's profile from a capture and store them
    Discover {
        /// Capture file (JSON)
        capture: PathBuf,

        /// Discovery plan (JSON); the built-in plan when omitted
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Locator configuration (TOML)
        #[arg(short, long, env = "LOCATOR_CONFIG")]
        config: Option<PathBuf>,

        /// Where to store the built profiles
        #[arg(long, default_value = STORE_FILE)]
        store: PathBuf,
    },

    /// Read every field of live instances in a capture
    Locate {
        /// Capture file (JSON)
        capture: PathBuf,

        /// Instance base address in hex; defaults to the capture's instances
        #[arg(long = "base")]
        bases: Vec<String>,

        /// Discovery plan (JSON); the built-in plan when omitted
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Locator configuration (TOML)
        #[arg(short, long, env = "LOCATOR_CONFIG")]
        config: Option<PathBuf>,

        /// Reuse profiles from this store when they match the plan
        #[arg(long)]
        store: Option<PathBuf>,

        /// Ignore stored profiles older than this many hours
        #[arg(long)]
        max_age_hours: Option<i64>,

        /// Print outcomes as JSON
        #[arg(long)]
        json: bool,
    },

    /// Offset between two addresses, for writing plan candidates
    Offset {
        /// Object or slot address (hex)
        from: String,

        /// Field address (hex)
        to: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let directive = if args.verbose {
        "locator_core=debug"
    } else {
        "locator_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Plan { bits, output } => commands::plan::run(bits, output.as_deref()),
        Command::Discover {
            capture,
            plan,
            config,
            store,
        } => commands::discover::run(&capture, plan.as_deref(), config.as_deref(), &store),
        Command::Locate {
            capture,
            bases,
            plan,
            config,
            store,
            max_age_hours,
            json,
        } => commands::locate::run(commands::locate::LocateArgs {
            capture: &capture,
            bases: &bases,
            plan: plan.as_deref(),
            config: config.as_deref(),
            store: store.as_deref(),
            max_age_hours,
            json,
        }),
        Command::Offset { from, to } => commands::offset::run(&from, &to),
    }
}
