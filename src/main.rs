use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tourdash::api::HttpClient;
use tourdash::ban::{BanCountdown, TimedStatus};
use tourdash::cache::{Coordinator, EntityId, EntityKind, ListKey, Mutation, SortSpec};
use tourdash::config::Config;

#[derive(Parser, Debug)]
#[command(name = "tourdash")]
#[command(about = "Inspect and manage tourism dashboard data from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tourdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show one entity
  Show { kind: String, id: String },
  /// List entities of a kind
  List {
    kind: String,
    /// Filter as key=value, repeatable
    #[arg(short, long = "filter")]
    filters: Vec<String>,
    /// Sort by this field on the client
    #[arg(long)]
    sort: Option<String>,
    /// Sort descending
    #[arg(long, requires = "sort")]
    desc: bool,
  },
  /// Delete one entity
  Delete { kind: String, id: String },
  /// Follow a user's ban countdown until it ends
  BanStatus { user_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose, args.log_stderr)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let client = HttpClient::new(&config)?;
  let cache = Coordinator::new(client, config.cache.clone());
  cache.on_session_expired(|| {
    eprintln!("Session rejected by the backend. Check TOURDASH_API_TOKEN.");
  });

  let outcome = run(&cache, args.command).await;
  cache.teardown();
  outcome
}

async fn run(cache: &Coordinator<HttpClient>, command: Command) -> Result<()> {
  match command {
    Command::Show { kind, id } => {
      let kind: EntityKind = kind.parse()?;
      let result = cache.get_or_fetch(kind, EntityId::parse(&id)?).await?;
      print_json(&result.data)?;
    }
    Command::List {
      kind,
      filters,
      sort,
      desc,
    } => {
      let key = parse_list_key(&kind, &filters)?;
      let result = cache.fetch_list(&key).await?;
      let items = match sort {
        Some(field) => {
          let spec = if desc {
            SortSpec::descending(field)
          } else {
            SortSpec::ascending(field)
          };
          cache.sorted_list(&key, &spec).unwrap_or(result.data)
        }
        None => result.data,
      };
      print_json(&items)?;
    }
    Command::Delete { kind, id } => {
      let kind: EntityKind = kind.parse()?;
      let id = EntityId::parse(&id)?;
      cache.mutate(kind, id.clone(), Mutation::Delete).await?;
      println!("Deleted {} {}", kind, id);
    }
    Command::BanStatus { user_id } => {
      follow_ban(cache, EntityId::parse(&user_id)?).await?;
    }
  }
  Ok(())
}

/// Print every countdown change until the ban ends, then refresh the user.
async fn follow_ban(cache: &Coordinator<HttpClient>, user: EntityId) -> Result<()> {
  let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();
  let api = cache.transport().clone();

  let mut countdown = BanCountdown::new();
  let mut status = countdown.subscribe();
  countdown.start(
    user.clone(),
    move |subject| async move { api.fetch_remaining(&subject).await },
    move |subject| {
      let _ = expired_tx.send(subject);
    },
  );

  loop {
    tokio::select! {
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let current = status.borrow_and_update().clone();
        match &current {
          TimedStatus::Countdown(remaining) => println!("Banned for {}", remaining),
          TimedStatus::Permanent => println!("Banned permanently"),
          TimedStatus::Error(msg) => return Err(eyre!("Could not load ban status: {}", msg)),
          TimedStatus::Loading | TimedStatus::Unknown | TimedStatus::Expired => {}
        }
        if current == TimedStatus::Permanent {
          break;
        }
      }
      Some(subject) = expired_rx.recv() => {
        println!("Ban expired");
        cache.invalidate(EntityKind::User, subject.clone());
        let user = cache.get_or_fetch(EntityKind::User, subject).await?;
        print_json(&user.data)?;
        break;
      }
      _ = tokio::signal::ctrl_c() => {
        info!("interrupted");
        break;
      }
    }
  }

  countdown.stop();
  Ok(())
}

fn parse_list_key(kind: &str, filters: &[String]) -> Result<ListKey> {
  let mut key = ListKey::new(kind.parse()?);
  for filter in filters {
    let (name, value) = filter
      .split_once('=')
      .ok_or_else(|| eyre!("Filter '{}' must look like key=value", filter))?;
    key = key.with_filter(name.trim(), value.trim());
  }
  Ok(key)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Log to a daily file under the data directory so stdout stays clean.
fn init_tracing(verbose: bool, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let default_level = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("tourdash={}", default_level)));

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("tourdash")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "tourdash.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
