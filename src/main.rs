//! Inspection CLI over the on-disk stores.
//!
//! Every command opens the same tier chain an embedding application uses, so
//! what it prints is exactly what the application will see on its next start.
//! The event bus is created offline: servicing the queue from here moves
//! records around but never attempts a delivery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use lifeboat::backup::{BackupManager, SessionSource, SessionState};
use lifeboat::cache::{HttpFetcher, Partition, RequestCache};
use lifeboat::config::Config;
use lifeboat::events::{EventBus, Notifier};
use lifeboat::metrics::Metrics;
use lifeboat::storage::TieredStore;
use lifeboat::sync::{HttpTransport, SyncQueue};

#[derive(Parser, Debug)]
#[command(name = "lifeboat")]
#[command(about = "Inspect and service the offline-resilience stores")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lifeboat/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show tier availability, cache entry counts and queue depths
  Stats,
  /// Cache maintenance
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Sync queue inspection and dead-letter servicing
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Session snapshot listing, export and cleanup
  #[command(subcommand)]
  Backup(BackupCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Delete every cached response in every partition
  Purge,
  /// Delete expired entries and trim partitions over capacity
  Sweep,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List pending submissions
  List,
  /// List dead letters
  Dead,
  /// Move a dead letter back to the pending queue for fresh attempts
  Requeue {
    /// Dead letter id
    id: Uuid,
  },
  /// Drop one dead letter without requeueing it
  Discard {
    /// Dead letter id
    id: Uuid,
  },
  /// Drop every dead letter
  Clear,
  /// Remove a pending submission without delivering it
  Cancel {
    /// Pending item id
    id: Uuid,
  },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
  /// List stored snapshots, newest first
  List,
  /// Write every snapshot as a JSON bundle
  Export {
    /// Output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Delete snapshots past their retention window
  Prune,
  /// Delete one snapshot
  Delete {
    /// Snapshot id
    id: Uuid,
  },
}

/// The CLI has no live session to capture; it only reads, exports and
/// deletes what previous runs stored.
struct InertSession;

impl SessionSource for InertSession {
  fn collect(&self) -> SessionState {
    SessionState::default()
  }
}

struct Services {
  store: Arc<TieredStore>,
  queue: SyncQueue,
  backup: BackupManager,
  config: Config,
  metrics: Arc<Metrics>,
}

impl Services {
  fn open(config: Config) -> Result<Self> {
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(TieredStore::open_default(
      &config.storage,
      Arc::clone(&metrics),
    )?);
    let events = Arc::new(EventBus::with_connectivity(false));
    let notifier = Arc::new(Notifier::new());
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
      config.sync.request_timeout_secs,
    ))?);
    let queue = SyncQueue::new(
      Arc::clone(&store),
      transport,
      Arc::clone(&events),
      notifier,
      config.sync.clone(),
      Arc::clone(&metrics),
    );
    let backup = BackupManager::new(
      Arc::clone(&store),
      Arc::new(InertSession),
      events,
      Arc::new(Notifier::new()),
      config.backup.clone(),
      Arc::clone(&metrics),
    );
    Ok(Self {
      store,
      queue,
      backup,
      config,
      metrics,
    })
  }

  /// Build the cache engine on demand. Constructing it honors the version
  /// stamp, exactly as an embedding application would, so only the cache
  /// commands pay that cost.
  fn cache(&self) -> Result<RequestCache> {
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
      self.config.cache.request_timeout_secs,
    ))?);
    Ok(RequestCache::new(
      Arc::clone(&self.store),
      fetcher,
      Arc::new(EventBus::with_connectivity(false)),
      self.config.cache.clone(),
      Arc::clone(&self.metrics),
    ))
  }
}

/// Log to a daily-rolled file under the data directory; `RUST_LOG` overrides
/// the default level.
fn init_tracing(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = config.storage.resolve_data_dir()?.join("logs");
  let appender = tracing_appender::rolling::daily(log_dir, "lifeboat.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config)?;

  let services = Services::open(config)?;

  match args.command {
    Command::Stats => stats(&services),
    Command::Cache(command) => match command {
      CacheCommand::Purge => cache_purge(&services)?,
      CacheCommand::Sweep => cache_sweep(&services)?,
    },
    Command::Queue(command) => match command {
      QueueCommand::List => queue_list(&services),
      QueueCommand::Dead => queue_dead(&services),
      QueueCommand::Requeue { id } => {
        services.queue.requeue_dead_letter(id)?;
        println!("requeued {id}");
      }
      QueueCommand::Discard { id } => {
        services.queue.clear_dead_letter(id)?;
        println!("discarded {id}");
      }
      QueueCommand::Clear => {
        let dropped = services.queue.clear_dead_letters();
        println!("dropped {dropped} dead letters");
      }
      QueueCommand::Cancel { id } => {
        services.queue.cancel(id)?;
        println!("cancelled {id}");
      }
    },
    Command::Backup(command) => match command {
      BackupCommand::List => backup_list(&services),
      BackupCommand::Export { output } => backup_export(&services, output.as_deref())?,
      BackupCommand::Prune => {
        let pruned = services.backup.prune();
        println!("pruned {pruned} snapshots");
      }
      BackupCommand::Delete { id } => {
        services.backup.delete_snapshot(id)?;
        println!("deleted {id}");
      }
    },
  }

  Ok(())
}

fn stats(services: &Services) {
  println!("storage tiers: {}", services.store.tier_names().join(", "));
  println!();
  println!("cache entries:");
  for partition in Partition::ALL {
    println!(
      "  {:<8} {}",
      partition.as_str(),
      services.store.count(partition.namespace())
    );
  }
  println!();
  println!(
    "sync queue: {} pending, {} dead",
    services.queue.pending().len(),
    services.queue.dead_letters().len()
  );
  println!("snapshots: {}", services.backup.snapshots().len());
}

fn cache_purge(services: &Services) -> Result<()> {
  let cache = services.cache()?;
  let total: usize = cache.partition_counts().iter().map(|(_, n)| n).sum();
  cache.purge_all();
  println!("purged {total} cached responses");
  Ok(())
}

fn cache_sweep(services: &Services) -> Result<()> {
  let removed = services.cache()?.sweep();
  println!("removed {removed} expired or excess entries");
  Ok(())
}

fn queue_list(services: &Services) {
  let pending = services.queue.pending();
  if pending.is_empty() {
    println!("no pending submissions");
    return;
  }
  for item in pending {
    let due = item
      .next_attempt_at
      .map_or_else(|| "now".to_string(), |at| at.to_string());
    println!(
      "{}  {:?}  attempts {}/{}  due {}  {} -> {}",
      item.id, item.kind, item.attempts, item.max_attempts, due, item.label, item.target
    );
  }
}

fn queue_dead(services: &Services) {
  let dead = services.queue.dead_letters();
  if dead.is_empty() {
    println!("no dead letters");
    return;
  }
  for letter in dead {
    println!(
      "{}  {:?}  failed {}  after {} attempts  {} -> {}",
      letter.item.id,
      letter.item.kind,
      letter.failed_at,
      letter.item.attempts,
      letter.item.label,
      letter.item.target
    );
    if let Some(error) = &letter.item.last_error {
      println!("    last error: {error}");
    }
  }
}

fn backup_list(services: &Services) {
  let snapshots = services.backup.snapshots();
  if snapshots.is_empty() {
    println!("no snapshots");
    return;
  }
  for snapshot in snapshots {
    let summary = snapshot.summary();
    println!(
      "{}  {}  {:?}/{:?}  {} fields  at {}{}",
      summary.id,
      summary.captured_at,
      summary.trigger,
      summary.scope,
      summary.field_count,
      summary.location,
      summary
        .description
        .as_deref()
        .map_or_else(String::new, |d| format!("  ({d})"))
    );
  }
}

fn backup_export(services: &Services, output: Option<&std::path::Path>) -> Result<()> {
  let export = services.backup.export_backups();
  let json = serde_json::to_string_pretty(&export)?;
  match output {
    Some(path) => {
      std::fs::write(path, json)?;
      println!(
        "wrote {} snapshots to {}",
        export.snapshots.len(),
        path.display()
      );
    }
    None => println!("{json}"),
  }
  Ok(())
}
