use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use entity_cache::cache::SqliteMedium;
use entity_cache::{
  logging, CacheStore, Comparison, Config, EntityId, EntityRecord, EntityStore, HttpRemote,
  LoadOptions, QueryDescriptor, SortDirection,
};

#[derive(Parser, Debug)]
#[command(name = "entity-cache")]
#[command(about = "Cached, coalescing access to a remote entity store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/entity-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Remote store base URL, overriding the config file
  #[arg(long)]
  base_url: Option<String>,

  /// Write logs to a daily-rotated file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load one entity
  Load {
    entity_type: String,
    id: String,
    /// Ignore any cached copy
    #[arg(long)]
    reset: bool,
  },
  /// List entities
  List(ListArgs),
  /// Create or update an entity from a JSON object
  Save { entity_type: String, json: String },
  /// Delete an entity
  Delete { entity_type: String, id: String },
  /// Show the registered entity types
  Types,
  /// Manage the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(ClapArgs, Debug)]
struct ListArgs {
  entity_type: String,
  #[arg(long)]
  page: Option<u32>,
  #[arg(long)]
  page_size: Option<u32>,
  /// Field to return (repeatable)
  #[arg(long = "field")]
  fields: Vec<String>,
  /// Filter as field=value (repeatable)
  #[arg(long = "filter")]
  filters: Vec<String>,
  /// Comparison for a filtered field as field=op (repeatable)
  #[arg(long = "op")]
  comparisons: Vec<String>,
  /// Ordering as field[:asc|desc] (repeatable)
  #[arg(long = "sort")]
  sorts: Vec<String>,
  /// Server option as name=value or name.column=value (repeatable)
  #[arg(long = "option")]
  options: Vec<String>,
  /// Return fully loaded entities
  #[arg(long)]
  full: bool,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Drop every cached entry
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_dir.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(base_url) = args.base_url {
    config.remote.base_url = Some(base_url);
  }
  let registry = config.registry();

  let medium = match &config.cache.path {
    Some(path) => SqliteMedium::open_at(path)?,
    None => SqliteMedium::open()?,
  };
  let cache = CacheStore::new(medium);

  let command = match args.command {
    Command::Cache {
      action: CacheAction::Clear,
    } => {
      cache.clear();
      info!("cache cleared");
      return Ok(());
    }
    Command::Types => {
      for ty in registry.types() {
        let ops: Vec<&str> = ty.operations.iter().map(|op| op.as_str()).collect();
        println!("{}\t{}\t{}", ty.name, ty.primary_key, ops.join(","));
      }
      return Ok(());
    }
    other => other,
  };

  let remote = HttpRemote::new(&config.remote, &registry)?;
  let store = EntityStore::new(registry, config.cache.clone(), cache, Arc::new(remote));

  match command {
    Command::Load {
      entity_type,
      id,
      reset,
    } => {
      let record = store
        .load_with(&entity_type, parse_id(&id)?, LoadOptions { reset })
        .await?;
      print_json(&record.to_json())?;
    }
    Command::List(list) => {
      let query = build_query(&list)?;
      let records = store.list(&list.entity_type, &query).await?;
      let items: Vec<Value> = records.iter().map(EntityRecord::to_json).collect();
      print_json(&Value::Array(items))?;
    }
    Command::Save { entity_type, json } => {
      let value: Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse record JSON: {}", e))?;
      let record = EntityRecord::from_json(&entity_type, value)
        .ok_or_else(|| eyre!("Record JSON must be an object"))?;
      let saved = store.save(record).await?;
      print_json(&saved.to_json())?;
    }
    Command::Delete { entity_type, id } => {
      store.remove(&entity_type, parse_id(&id)?).await?;
      info!(%entity_type, %id, "deleted");
    }
    Command::Types | Command::Cache { .. } => {}
  }

  Ok(())
}

fn parse_id(raw: &str) -> Result<EntityId> {
  EntityId::parse(raw).ok_or_else(|| eyre!("Invalid entity id: '{}'", raw))
}

fn build_query(list: &ListArgs) -> Result<QueryDescriptor> {
  let mut query = QueryDescriptor::new();

  for field in &list.fields {
    query = query.select(field.as_str());
  }
  for filter in &list.filters {
    let (field, value) = split_pair(filter, '=')?;
    query = query.filter(field, value);
  }
  for comparison in &list.comparisons {
    let (field, op) = split_pair(comparison, '=')?;
    let op: Comparison = op.parse().map_err(|e: String| eyre!(e))?;
    query = query.compare(field, op);
  }
  for sort in &list.sorts {
    let (field, direction) = match sort.split_once(':') {
      Some((field, dir)) => (field, dir.parse().map_err(|e: String| eyre!(e))?),
      None => (sort.as_str(), SortDirection::Asc),
    };
    query = query.order_by(field, direction);
  }
  for option in &list.options {
    let (name, value) = split_pair(option, '=')?;
    query = match name.split_once('.') {
      Some((name, column)) => query.option_column(name, column, value),
      None => query.option(name, value),
    };
  }
  // After the options, so --full wins over a raw entity_load option.
  if list.full {
    query = query.load_entities(true);
  }
  if let Some(page) = list.page {
    query = query.page(page);
  }
  if let Some(page_size) = list.page_size {
    query = query.page_size(page_size);
  }

  Ok(query)
}

fn split_pair(raw: &str, sep: char) -> Result<(&str, &str)> {
  raw
    .split_once(sep)
    .filter(|(key, _)| !key.is_empty())
    .ok_or_else(|| eyre!("Expected field{}value, got '{}'", sep, raw))
}

fn print_json(value: &Value) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render JSON: {}", e))?;
  println!("{}", text);
  Ok(())
}
