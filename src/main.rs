use chatcache::api::{HttpApiClient, RestRemote};
use chatcache::cache::{CacheManager, LocalStore, NoopStore, StoreStats};
use chatcache::config::Config;
use chatcache::sync::{Connectivity, SyncCoordinator, SyncOptions, SyncTrigger};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "chatcache")]
#[command(about = "Inspect and sync the local chat cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chatcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cache counters, overall and for one scope
  Stats {
    #[arg(long)]
    scope: Option<String>,
  },
  /// List cached chats of a scope
  Chats {
    #[arg(long)]
    scope: String,
  },
  /// List cached messages of a chat
  Messages {
    #[arg(long)]
    scope: String,
    #[arg(long)]
    chat: String,
  },
  /// Remove everything cached for a scope
  Clear {
    #[arg(long)]
    scope: String,
  },
  /// Wipe the whole cache
  ClearAll,
  /// Drop the cached chat list of a scope
  InvalidateChats {
    #[arg(long)]
    scope: String,
  },
  /// Fetch chats (and optionally one chat's messages) into the cache
  Sync {
    #[arg(long)]
    scope: String,
    #[arg(long)]
    chat: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging()?;

  let policy = config.cache.freshness.policy();
  if config.cache.enabled {
    let cache = CacheManager::sqlite(config.cache.path.clone(), policy);
    run(cache, &config, args.command).await
  } else {
    info!("cache disabled, running network-only");
    let cache = CacheManager::new(|| Ok(NoopStore), policy);
    run(cache, &config, args.command).await
  }
}

/// Log to a daily file in the data directory so stdout stays command output.
fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("chatcache")
    .join("logs");
  std::fs::create_dir_all(&dir)?;

  let appender = tracing_appender::rolling::daily(dir, "chatcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("CHATCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

async fn run<S: LocalStore>(
  cache: CacheManager<S>,
  config: &Config,
  command: Command,
) -> Result<()> {
  let cache = Arc::new(cache);

  // `sync` works without a cache; everything else inspects it
  let initialized = cache.initialize().await;
  if !matches!(command, Command::Sync { .. }) {
    initialized?;
  }

  match command {
    Command::Stats { scope } => {
      if let Some(scope) = scope {
        cache.set_scope(scope);
      }
      let stats = cache.get_cache_stats().await?;
      if let Some(scope) = &stats.scope_id {
        println!("scope {}", scope);
        print_stats(&stats.scope);
        println!();
      }
      println!("total");
      print_stats(&stats.total);
    }
    Command::Chats { scope } => {
      cache.set_scope(scope);
      let snapshot = cache.get_chats().await?;
      if !snapshot.from_cache {
        println!("no cached chats");
        return Ok(());
      }
      if let Some(fetched_at) = snapshot.fetched_at {
        let freshness = if snapshot.is_stale { "stale" } else { "fresh" };
        println!("fetched {} ({})", fetched_at.to_rfc3339(), freshness);
      }
      for chat in &snapshot.chats {
        println!(
          "{:<26} {:<24} {}",
          chat.id,
          chat.name.as_deref().or(chat.phone.as_deref()).unwrap_or("-"),
          chat.last_message.as_deref().unwrap_or("")
        );
      }
    }
    Command::Messages { scope, chat } => {
      cache.set_scope(scope);
      let Some(snapshot) = cache.get_all_messages(&chat).await? else {
        println!("no cached messages for {}", chat);
        return Ok(());
      };
      println!(
        "{} of {} messages, fetched {}{}",
        snapshot.items.len(),
        snapshot.total_count,
        snapshot.fetched_at.to_rfc3339(),
        if snapshot.is_stale { " (stale)" } else { "" }
      );
      for message in &snapshot.items {
        println!(
          "{} {:<9} {:<26} {}",
          message.timestamp.format("%Y-%m-%d %H:%M"),
          message.status.to_string(),
          message.key(),
          message.text.as_deref().unwrap_or("")
        );
      }
    }
    Command::Clear { scope } => {
      cache.clear_scope(&scope).await?;
      println!("cleared scope {}", scope);
    }
    Command::ClearAll => {
      cache.clear_all_cache().await?;
      println!("cleared all cached data");
    }
    Command::InvalidateChats { scope } => {
      cache.set_scope(scope);
      cache.invalidate_chat_cache().await?;
      println!("chat list invalidated");
    }
    Command::Sync { scope, chat } => {
      cache.set_scope(scope);
      let client = HttpApiClient::new(&config.api, Config::get_api_token().as_deref())?;
      let remote = Arc::new(RestRemote::new(client, config.api.endpoints.clone()));
      let sync = SyncCoordinator::new(
        Arc::clone(&cache),
        remote,
        Connectivity::online(),
        SyncOptions::from(&config.cache),
      );

      let chats = sync.load_chats(SyncTrigger::PullToRefresh).await;
      if let Some(e) = &chats.cache_error {
        eprintln!("warning: cache unavailable: {}", e);
      }
      if let Some(e) = chats.error {
        return Err(eyre!("Chat sync failed: {}", e));
      }
      println!("synced {} chats", chats.data.len());

      if let Some(chat) = chat {
        let messages = sync.load_messages(&chat, SyncTrigger::PullToRefresh).await;
        if let Some(e) = messages.error {
          return Err(eyre!("Message sync failed for {}: {}", chat, e));
        }
        println!(
          "synced {} of {} messages for {}",
          messages.data.len(),
          messages.total_count.unwrap_or(0),
          chat
        );
      }
    }
  }

  Ok(())
}

fn print_stats(stats: &StoreStats) {
  println!("  scopes:      {}", stats.scopes);
  println!("  collections: {}", stats.collections);
  println!("  items:       {}", stats.items);
  println!("  settings:    {}", stats.settings);
  if let (Some(oldest), Some(newest)) = (stats.oldest_fetched_at, stats.newest_fetched_at) {
    println!("  fetched:     {} .. {}", oldest.to_rfc3339(), newest.to_rfc3339());
  }
}
