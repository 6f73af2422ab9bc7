use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

pub mod client;
pub mod config;
pub mod document;
pub mod protocol;
pub mod server;
pub mod transport;
mod utils;

use client::{Client, StdoutView};
use config::AppConfig;
use document::Direction;
use server::Server;

/// Scrivener - a collaborative real-time text editor coordination server and client.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Host a document, accepting client subscriptions.
  Host {
    /// Path to the document file. Created empty if it doesn't exist.
    file: PathBuf,
    #[arg(long, default_value_t = 7420)]
    interactive_port: u16,
    #[arg(long, default_value_t = 7421)]
    broadcast_port: u16,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
  },
  /// Join a running host as a participant.
  Join {
    /// Host address to connect to (hostname or IP, no port).
    server_host: String,
    #[arg(long, default_value_t = 7420)]
    interactive_port: u16,
    #[arg(long, default_value_t = 7421)]
    broadcast_port: u16,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
  },
}

#[must_use]
pub fn parse() -> Cli {
  Cli::parse()
}

pub fn run() -> Result<()> {
  let cli = parse();
  match cli.command {
    Command::Host {
      file,
      interactive_port,
      broadcast_port,
      log_level,
      config,
    } => {
      let cfg = AppConfig::load(config.as_deref())?.with_log_level_override(log_level);
      init_logging(&cfg);
      run_host(&file, interactive_port, broadcast_port, &cfg)
    }
    Command::Join {
      server_host,
      interactive_port,
      broadcast_port,
      log_level,
      config,
    } => {
      let cfg = AppConfig::load(config.as_deref())?.with_log_level_override(log_level);
      init_logging(&cfg);
      run_join(&server_host, interactive_port, broadcast_port, &cfg)
    }
  }
}

fn init_logging(cfg: &AppConfig) {
  let mut builder = env_logger::Builder::from_default_env();
  if std::env::var("RUST_LOG").is_err() {
    builder.parse_filters(&cfg.log_level);
  }
  let _ = builder.try_init();
}

fn run_host(file: &PathBuf, interactive_port: u16, broadcast_port: u16, cfg: &AppConfig) -> Result<()> {
  log_info!(
    "hosting {} on interactive port {} / broadcast port {}",
    file.display(),
    interactive_port,
    broadcast_port
  );
  let server = Server::bind(
    file,
    ("0.0.0.0", interactive_port),
    ("0.0.0.0", broadcast_port),
    cfg,
  )
  .context("failed to start server")?;
  server.run(cfg)
}

fn run_join(host: &str, interactive_port: u16, broadcast_port: u16, cfg: &AppConfig) -> Result<()> {
  let client = Client::connect(
    (host, interactive_port),
    (host, broadcast_port),
    Box::new(StdoutView),
    cfg.client_poll_timeout,
    cfg.echo_interval,
  )
  .context("failed to connect to host")?;
  let uuid = client.subscribe().context("subscribe failed")?;
  log_success!("subscribed as {uuid}");

  println!("type: 'l'/'r'/'u'/'d' to move, 'bs' backspace, 'del' delete, 'enter', or any other text to insert char-by-char; 'quit' to exit");
  let stdin = std::io::stdin();
  for line in stdin.lock().lines() {
    let line = line.context("failed to read stdin")?;
    match line.trim() {
      "quit" => break,
      "l" => client.move_cursor(Direction::Left)?,
      "r" => client.move_cursor(Direction::Right)?,
      "u" => client.move_cursor(Direction::Up)?,
      "d" => client.move_cursor(Direction::Down)?,
      "bs" => client.move_cursor(Direction::Backspace)?,
      "del" => client.move_cursor(Direction::Delete)?,
      "enter" => client.move_cursor(Direction::Enter)?,
      text => {
        for c in text.chars() {
          client.insert_char(c)?;
        }
      }
    }
  }
  client.unsubscribe().context("unsubscribe failed")?;
  Ok(())
}
