//! Parley CLI
//!
//! Replays recorded provider event streams through the reconciler and exposes
//! the incremental JSON parser for inspection.

mod render;
mod replay;

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_core::{parse_partial, ReconcilerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley", version, about = "Streaming transcript reconciler")]
struct Cli {
    /// Path to a reconciler config file (defaults to ~/.parley/config.toml)
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Feed a JSONL file of stream events through the reconciler
    Replay {
        /// One event per line; blank lines are skipped
        events: PathBuf,

        /// User message to open the transcript with
        #[arg(long)]
        prompt: Option<String>,

        /// Print the transcript as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Wrap text output at this width
        #[arg(long, default_value_t = 80)]
        width: usize,

        /// Save the final transcript into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Session id used for the saved file (defaults to the events file name)
        #[arg(long)]
        session: Option<String>,
    },

    /// Run the incremental JSON parser on TEXT, or stdin when omitted
    Parse {
        text: Option<String>,

        /// Print the derived value for every prefix of the input
        #[arg(long)]
        prefixes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PARLEY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            events,
            prompt,
            json,
            width,
            save_dir,
            session,
        } => {
            let config = match &cli.config {
                Some(path) => ReconcilerConfig::load(path)?,
                None => ReconcilerConfig::load_default()?,
            };
            let options = replay::ReplayOptions {
                prompt,
                save_dir,
                session,
            };
            let transcript = replay::run(&events, config, &options).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&transcript)
                        .context("Failed to serialize transcript")?
                );
            } else {
                print!("{}", render::render_transcript(&transcript, width));
            }
        }
        Command::Parse { text, prefixes } => {
            let input = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read stdin")?;
                    buf
                }
            };
            if prefixes {
                for (prefix, value) in render::prefix_values(&input) {
                    println!("{:<40} => {}", format!("{:?}", prefix), value);
                }
            } else {
                println!("{}", render::value_or_none(parse_partial(&input).as_ref()));
            }
        }
    }

    Ok(())
}
