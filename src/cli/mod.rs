//! Command-line interface for piperelay.
//!
//! The CLI is a host collaborator: it resolves configuration, opens the
//! relay and feeds it events from arguments or stdin. It also provides a
//! consumer-side `decode` for reading records back off a pipe.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};

use crate::codec::RecordReader;
use crate::config::{self, Overrides, ResolvedConfig};
use crate::domain::{EventKind, FieldValue};
use crate::pipe::OpenMode;
use crate::relay::{EventSink, Relay};

pub mod relay;

pub use relay::BrokenPipePolicy;

/// piperelay - Ordered lifecycle event relay to named pipes
#[derive(Parser, Debug)]
#[command(name = "piperelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Relay target options shared by every subcommand
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Named pipe to write to (repeatable; overrides PIPERELAY_NAMED_PIPE)
    #[arg(short, long = "pipe", global = true)]
    pub pipes: Vec<PathBuf>,

    /// Session id (generated if not set anywhere)
    #[arg(short, long, global = true)]
    pub session: Option<String>,

    /// What to do when no reader is attached
    #[arg(short, long, value_enum, global = true)]
    pub mode: Option<ModeArg>,

    /// Give up waiting for a reader after this many milliseconds
    #[arg(long, global = true)]
    pub open_timeout_ms: Option<u64>,

    /// Refuse to share a pipe with another piperelay writer
    #[arg(long, global = true)]
    pub exclusive: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish a single event
    Emit {
        /// Event kind (e.g. task-start, playbook-end)
        kind: String,

        /// Field as key=value (repeatable)
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Publish JSON events read line by line from stdin
    Relay {
        /// What to do when a reader disconnects
        #[arg(long, value_enum, default_value = "fail")]
        on_broken_pipe: BrokenPipePolicy,
    },

    /// Decode wire records (from stdin or a pipe) into JSON lines
    Decode {
        /// Read from this path instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Print the session id this process would use
    Session,

    /// Show resolved configuration (debug)
    Config,
}

/// Open mode for CLI (maps to OpenMode)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// Wait for a reader to attach
    Blocking,

    /// Fail immediately without a reader
    Nonblocking,
}

impl From<ModeArg> for OpenMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Blocking => OpenMode::Blocking,
            ModeArg::Nonblocking => OpenMode::NonBlocking,
        }
    }
}

impl From<&TargetArgs> for Overrides {
    fn from(args: &TargetArgs) -> Self {
        Overrides {
            pipes: args.pipes.clone(),
            session_id: args.session.clone(),
            mode: args.mode.map(OpenMode::from),
            open_timeout_ms: args.open_timeout_ms,
            exclusive: args.exclusive,
        }
    }
}

/// Parse a `key=value` field argument
fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::load(&Overrides::from(&self.target))?;

        match self.command {
            Commands::Emit { kind, fields } => emit(&config, &kind, fields).await,
            Commands::Relay { on_broken_pipe } => relay::run(&config, on_broken_pipe).await,
            Commands::Decode { input } => decode(input).await,
            Commands::Session => {
                println!("{}", config.session);
                Ok(())
            }
            Commands::Config => {
                show_config(&config);
                Ok(())
            }
        }
    }
}

/// Open a relay over every configured target
pub(crate) async fn connect(config: &ResolvedConfig) -> Result<Relay> {
    let targets = config.targets()?.to_vec();
    Relay::connect(config.session.clone(), targets, config.writer.clone())
        .await
        .context("Failed to open named pipes")
}

async fn emit(config: &ResolvedConfig, kind: &str, fields: Vec<(String, String)>) -> Result<()> {
    let kind: EventKind = kind.parse().context("Invalid event kind")?;

    let relay = connect(config).await?;

    let event = fields
        .into_iter()
        .fold(relay.event(kind), |event, (key, value)| {
            event.with_field(key, FieldValue::infer(&value))
        });

    let published = relay.publish(&event).await;
    let closed = relay.close().await;

    published.context("Failed to publish event")?;
    closed.context("Failed to close named pipes")?;
    Ok(())
}

async fn decode(input: Option<PathBuf>) -> Result<()> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            print_records(BufReader::new(file)).await
        }
        None => print_records(BufReader::new(tokio::io::stdin())).await,
    }
}

async fn print_records<R: AsyncBufRead + Unpin>(input: R) -> Result<()> {
    let mut reader = RecordReader::new(input);
    let mut stdout = tokio::io::stdout();

    while let Some(event) = reader.next_event().await.context("Failed to decode record")? {
        let json = serde_json::to_string(&event).context("Failed to serialize event")?;
        stdout.write_all(format!("{}\n", json).as_bytes()).await?;
    }

    stdout.flush().await?;
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) {
    println!("piperelay configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Pipes:");
    if cfg.pipes.is_empty() {
        println!("  (none configured)");
    } else {
        for pipe in &cfg.pipes {
            let note = if pipe.is_fifo() { "" } else { "  [missing or not a FIFO]" };
            println!("  {}{}", pipe, note);
        }
    }
    println!();
    println!(
        "Session: {}{}",
        cfg.session,
        if cfg.session_generated { " (generated)" } else { "" }
    );
    println!();
    println!("Writer:");
    println!("  Mode:         {:?}", cfg.writer.mode);
    println!(
        "  Open timeout: {}",
        cfg.writer
            .open_timeout
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("  Exclusive:    {}", cfg.writer.exclusive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("name=deploy"),
            Ok(("name".to_string(), "deploy".to_string()))
        );
        assert_eq!(
            parse_field("expr=a=b"),
            Ok(("expr".to_string(), "a=b".to_string()))
        );
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn test_cli_parses_global_target_flags() {
        let cli = Cli::try_parse_from([
            "piperelay",
            "emit",
            "task-start",
            "-f",
            "name=deploy",
            "--pipe",
            "/tmp/a.fifo",
            "--pipe",
            "/tmp/b.fifo",
            "--mode",
            "nonblocking",
        ])
        .unwrap();

        let overrides = Overrides::from(&cli.target);
        assert_eq!(overrides.pipes.len(), 2);
        assert_eq!(overrides.mode, Some(OpenMode::NonBlocking));

        match cli.command {
            Commands::Emit { kind, fields } => {
                assert_eq!(kind, "task-start");
                assert_eq!(fields, vec![("name".to_string(), "deploy".to_string())]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_relay_policy_defaults_to_fail() {
        let cli = Cli::try_parse_from(["piperelay", "relay"]).unwrap();
        match cli.command {
            Commands::Relay { on_broken_pipe } => {
                assert_eq!(on_broken_pipe, BrokenPipePolicy::Fail)
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
