use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod loopback;
mod output;

use output::Output;

#[derive(Parser)]
#[command(name = "dchat")]
#[command(version)]
#[command(about = "Session and key routing for end-to-end encrypted chat")]
#[command(long_about = "Drive the chat core from the command line.\n\nReplays JSON-lines scripts of local commands and inbound transport events, printing session updates and transport requests as they happen.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/dchat)
    #[arg(long, global = true, env = "DCHAT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current identity
    Whoami,

    /// Set the display nickname
    Nickname {
        /// New nickname
        name: String,
    },

    /// Forget the stored identity
    Reset,

    /// Print the direct conversation id shared with a peer
    Cid {
        /// Peer user id
        peer: String,
    },

    /// Replay a JSON-lines script against a fresh chat core
    Run {
        /// Script file, or "-" for stdin
        #[arg(default_value = "-")]
        script: String,

        /// Stop at the first failing step
        #[arg(long)]
        fail_fast: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output::new(cli.json);

    let result = run(cli, &output);

    if let Err(e) = result {
        output.error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not find data directory")?
            .join("dchat"),
    };

    std::fs::create_dir_all(&data_dir)?;

    let mut config = config::Config::load(&data_dir)?;

    if !matches!(cli.command, Commands::Reset) {
        let (id, was_generated) = config.ensure_identity()?;
        if was_generated && !cli.json {
            eprintln!("Generated new identity: {}", id);
        }
    }

    match cli.command {
        Commands::Whoami => commands::identity::whoami(&config, output),
        Commands::Nickname { name } => commands::identity::set_nickname(&name, &mut config, output),
        Commands::Reset => commands::identity::reset(&mut config, output),
        Commands::Cid { peer } => commands::identity::conversation_id(&peer, &config, output),
        Commands::Run { script, fail_fast } => {
            commands::script::run(&script, fail_fast, &config, output)
        }
    }
}
