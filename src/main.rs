use bookclub::cache::{CacheService, DurableStore, MemoryStore, SqliteStore, SystemClock};
use bookclub::client::CachedClient;
use bookclub::config::{self, Config};
use bookclub::listener::ListenerRegistry;
use bookclub::logging::{self, LogTarget};
use bookclub::remote::{HttpRemoteStore, QueryDescriptor};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bookclub")]
#[command(about = "Inspect the book club client cache and watch live queries")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/bookclub/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log directory
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read and maintain cache entries
  #[command(subcommand)]
  Cache(CacheCommand),

  /// List events through the cache
  Events {
    /// Only events hosted by this user
    #[arg(short, long)]
    user: Option<String>,
  },

  /// Print every update of a live query until interrupted
  Watch {
    collection: String,

    /// Equality filter, e.g. --where toUserId=u1
    #[arg(short = 'w', long = "where", value_parser = parse_filter)]
    filters: Vec<(String, Value)>,

    #[arg(short, long)]
    limit: Option<u32>,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Print the cached value for a key
  Get { key: String },
  /// Cache a JSON value (plain text is stored as a string)
  Set {
    key: String,
    value: String,
    /// Time to live in minutes (default from config)
    #[arg(long, value_parser = parse_ttl)]
    ttl: Option<chrono::Duration>,
  },
  /// Remove a key from both tiers
  Remove { key: String },
  /// Remove every cache entry
  Clear,
  /// List cached keys
  Keys,
  /// Delete expired entries
  Sweep,
}

/// Parse `field=value`, reading the value as JSON when it is valid JSON.
fn parse_filter(raw: &str) -> Result<(String, Value), String> {
  let (field, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected field=value, got '{}'", raw))?;
  Ok((field.trim().to_string(), parse_value(value)))
}

fn parse_ttl(raw: &str) -> Result<chrono::Duration, String> {
  let minutes: i64 = raw
    .parse()
    .map_err(|e| format!("invalid number of minutes '{}': {}", raw, e))?;
  config::ttl_from_minutes(minutes).map_err(|e| e.to_string())
}

fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let target = if args.log_stderr {
    LogTarget::Stderr
  } else {
    LogTarget::default_directory()?
  };
  let _log_guard = logging::init(target)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  if config.cache.persistent {
    let storage = match &config.cache.database {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    run(args.command, &config, storage).await
  } else {
    run(args.command, &config, MemoryStore::new()).await
  }
}

async fn run<S: DurableStore>(command: Command, config: &Config, storage: S) -> Result<()> {
  let cache = CacheService::with_options(storage, config.cache.namespace.clone(), Arc::new(SystemClock));
  cache.spawn_sweeper(config.cache.sweep_interval());

  let result = match command {
    Command::Cache(command) => run_cache(command, &cache, config).await,
    Command::Events { user } => {
      let client = build_client(config, cache.clone())?;
      for event in client.events(user.as_deref()).await? {
        println!("{}", serde_json::to_string(&event)?);
      }
      Ok(())
    }
    Command::Watch {
      collection,
      filters,
      limit,
    } => {
      let client = build_client(config, cache.clone())?;
      let mut query = QueryDescriptor::collection(collection);
      for (field, value) in filters {
        query = query.where_eq(field, value);
      }
      if let Some(limit) = limit {
        query = query.limit(limit);
      }
      watch(&client, &query).await
    }
  };

  cache.shutdown();
  result
}

async fn run_cache<S: DurableStore>(
  command: CacheCommand,
  cache: &CacheService<S>,
  config: &Config,
) -> Result<()> {
  match command {
    CacheCommand::Get { key } => match cache.get::<Value>(&key).await {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => return Err(eyre!("'{}' is not cached", key)),
    },
    CacheCommand::Set { key, value, ttl } => {
      let ttl = match ttl {
        Some(ttl) => ttl,
        None => config.cache.default_ttl()?,
      };
      cache.set(&key, &parse_value(&value), ttl).await;
      info!(key = %key, ttl_minutes = ttl.num_minutes(), "Cached value from command line");
    }
    CacheCommand::Remove { key } => cache.remove(&key).await,
    CacheCommand::Clear => cache.clear().await,
    CacheCommand::Keys => {
      for key in cache.keys().await {
        println!("{}", key);
      }
    }
    CacheCommand::Sweep => {
      let removed = cache.purge_expired().await;
      println!("Removed {} expired entries", removed);
    }
  }
  Ok(())
}

fn build_client<S: DurableStore>(
  config: &Config,
  cache: CacheService<S>,
) -> Result<CachedClient<HttpRemoteStore, S>> {
  let remote_config = config.remote()?;
  let remote = HttpRemoteStore::new(
    &remote_config.base_url,
    Config::get_api_token(),
    remote_config.poll_interval(),
  )?;

  Ok(CachedClient::new(
    Arc::new(remote),
    cache,
    ListenerRegistry::new(config.listeners.idle_grace()),
    config.cache.default_ttl()?,
  ))
}

async fn watch<S: DurableStore>(
  client: &CachedClient<HttpRemoteStore, S>,
  query: &QueryDescriptor,
) -> Result<()> {
  info!(query = %query.description(), "Watching live query");

  let subscription = client.watch(query, |documents| {
    for document in documents {
      match serde_json::to_string(document) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Unprintable document {}: {}", document.id, e),
      }
    }
    println!("-- {} documents", documents.len());
  });

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  subscription.detach();
  client.live().registry().shutdown();
  Ok(())
}
