use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use backhaul::config::Config;
use backhaul::service::OfflineService;

#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Inspect and maintain the offline request cache and mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/backhaul/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cache and queue state
  Status {
    /// Emit machine-readable JSON
    #[arg(long)]
    json: bool,
  },
  /// Replay queued mutations now
  Drain,
  /// List mutations waiting for replay
  Queue,
  /// List mutations that exhausted their retries
  DeadLetters,
  /// Drop cached responses
  Clear {
    /// Clear a single bucket
    #[arg(long, conflicts_with = "all")]
    bucket: Option<String>,

    /// Clear every bucket, including rows from older cache versions
    #[arg(long)]
    all: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  init_tracing();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let service = OfflineService::open(config)?;

  match args.command {
    Command::Status { json } => {
      let status = service.status()?;
      if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
      } else {
        println!("version: {}", status.version);
        println!("online: {}", status.online);
        for (bucket, len) in &status.buckets {
          println!("bucket {}: {} entries", bucket, len);
        }
        println!("queued mutations: {}", status.queue_depth);
        println!("dead letters: {}", status.dead_letters);
        if let Some(oldest) = status.oldest_pending {
          println!("oldest pending: {}", oldest.to_rfc3339());
        }
      }
    }
    Command::Drain => {
      let result = service.drain_queue().await?;
      println!(
        "processed {} (succeeded {}, failed {}, dead-lettered {})",
        result.processed, result.succeeded, result.failed, result.dead_lettered
      );
    }
    Command::Queue => {
      let pending = service.pending_mutations()?;
      if pending.is_empty() {
        println!("queue is empty");
      }
      for m in pending {
        println!(
          "#{} {} {} (attempts {}, created {})",
          m.id,
          m.request.method,
          m.request.url,
          m.attempt_count,
          m.created_at.to_rfc3339()
        );
        if let Some(err) = &m.last_error {
          println!("    last error: {}", err);
        }
      }
    }
    Command::DeadLetters => {
      let dead = service.dead_letters()?;
      if dead.is_empty() {
        println!("no dead letters");
      }
      for m in dead {
        println!(
          "#{} {} {} (attempts {}, dead since {})",
          m.id,
          m.request.method,
          m.request.url,
          m.attempt_count,
          m.dead_at.to_rfc3339()
        );
        if let Some(err) = &m.last_error {
          println!("    last error: {}", err);
        }
      }
    }
    Command::Clear { bucket, all } => match (bucket, all) {
      (Some(bucket), false) => {
        service.clear_bucket(&bucket)?;
        println!("cleared bucket {}", bucket);
      }
      (None, true) => {
        service.clear_all()?;
        println!("cleared all cached responses");
      }
      _ => return Err(eyre!("pass either --bucket NAME or --all")),
    },
  }

  Ok(())
}

fn init_tracing() {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("backhaul=info"));

  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init();
}
