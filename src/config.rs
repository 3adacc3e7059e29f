use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::registry::{EntityType, Operation, TypeRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  /// Entity types beyond the built-in ones
  #[serde(default)]
  pub types: Vec<TypeDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Root URL of the record store (e.g. "https://example.com/api/")
  pub base_url: Option<String>,
  /// Per-request timeout, enforced by the HTTP client
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

/// Effective caching rule for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  pub enabled: bool,
  /// Seconds a cached copy stays valid; 0 means it never expires
  pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
  /// Default for types without an override
  #[serde(default)]
  pub enabled: bool,
  /// Default TTL in seconds (0 = never expire)
  #[serde(default = "default_expiration")]
  pub expiration: u64,
  /// SQLite file; defaults to the user data directory
  pub path: Option<PathBuf>,
  #[serde(default)]
  pub types: BTreeMap<String, TypeCacheOverride>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TypeCacheOverride {
  pub enabled: Option<bool>,
  pub expiration: Option<u64>,
}

fn default_expiration() -> u64 {
  3600
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      enabled: false,
      expiration: default_expiration(),
      path: None,
      types: BTreeMap::new(),
    }
  }
}

impl CacheSettings {
  /// Caching on for every type with the given TTL.
  pub fn enabled(ttl_secs: u64) -> Self {
    Self {
      enabled: true,
      expiration: ttl_secs,
      ..Self::default()
    }
  }

  /// Caching off for every type.
  pub fn disabled() -> Self {
    Self::default()
  }

  /// Override the policy of a single type.
  pub fn with_type(mut self, entity_type: impl Into<String>, policy: CachePolicy) -> Self {
    self.types.insert(
      entity_type.into(),
      TypeCacheOverride {
        enabled: Some(policy.enabled),
        expiration: Some(policy.ttl_secs),
      },
    );
    self
  }

  pub fn policy_for(&self, entity_type: &str) -> CachePolicy {
    let over = self.types.get(entity_type).copied().unwrap_or_default();
    CachePolicy {
      enabled: over.enabled.unwrap_or(self.enabled),
      ttl_secs: over.expiration.unwrap_or(self.expiration),
    }
  }
}

/// An entity type declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TypeDeclaration {
  pub name: String,
  pub primary_key: String,
  /// Supported operations; all of them when omitted
  pub operations: Option<Vec<Operation>>,
  #[serde(default)]
  pub wrap_writes: bool,
}

impl TypeDeclaration {
  fn to_entity_type(&self) -> EntityType {
    let entity_type =
      EntityType::new(&self.name, &self.primary_key).with_wrapped_writes(self.wrap_writes);
    match &self.operations {
      Some(ops) => entity_type.with_operations(ops),
      None => entity_type,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./entity-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/entity-cache/config.yaml
  ///
  /// Without any config file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("entity-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("entity-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;

    for decl in &config.types {
      if decl.name.trim().is_empty() || decl.primary_key.trim().is_empty() {
        return Err(eyre!(
          "Type declarations need a name and a primary_key (got name '{}')",
          decl.name
        ));
      }
    }

    Ok(config)
  }

  /// Built-in types plus those declared in the file.
  pub fn registry(&self) -> TypeRegistry {
    let mut registry = TypeRegistry::with_defaults();
    for decl in &self.types {
      registry.register(decl.to_entity_type());
    }
    registry
  }

  /// Get the remote API token from the environment.
  ///
  /// Checks ENTITY_CACHE_TOKEN. Requests are sent unauthenticated without it.
  pub fn get_api_token() -> Option<String> {
    std::env::var("ENTITY_CACHE_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.remote.timeout_secs, 30);
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.expiration, 3600);
    assert_eq!(
      config.cache.policy_for("node"),
      CachePolicy {
        enabled: false,
        ttl_secs: 3600
      }
    );
  }

  #[test]
  fn test_parse_full_file() {
    let config = Config::from_yaml(
      r#"
remote:
  base_url: https://example.com/api
  timeout_secs: 5
cache:
  enabled: true
  expiration: 60
  types:
    user:
      enabled: false
    taxonomy_term:
      expiration: 0
types:
  - name: widget
    primary_key: wid
    operations: [retrieve, index]
"#,
    )
    .unwrap();

    assert_eq!(config.remote.base_url.as_deref(), Some("https://example.com/api"));
    assert_eq!(config.remote.timeout_secs, 5);

    assert_eq!(
      config.cache.policy_for("node"),
      CachePolicy {
        enabled: true,
        ttl_secs: 60
      }
    );
    assert!(!config.cache.policy_for("user").enabled);
    assert_eq!(config.cache.policy_for("taxonomy_term").ttl_secs, 0);

    let registry = config.registry();
    let widget = registry.lookup("widget").unwrap();
    assert_eq!(widget.primary_key, "wid");
    assert!(widget.supports(Operation::Index));
    assert!(!widget.supports(Operation::Delete));
    assert!(registry.lookup("node").is_some());
  }

  #[test]
  fn test_empty_file_is_default() {
    let config = Config::from_yaml("{}").unwrap();
    assert!(config.types.is_empty());
    assert!(config.remote.base_url.is_none());
  }

  #[test]
  fn test_type_without_primary_key_rejected() {
    let result = Config::from_yaml(
      r#"
types:
  - name: widget
    primary_key: ""
"#,
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_builder_overrides() {
    let settings = CacheSettings::disabled().with_type(
      "widget",
      CachePolicy {
        enabled: true,
        ttl_secs: 60,
      },
    );
    assert!(settings.policy_for("widget").enabled);
    assert!(!settings.policy_for("node").enabled);
    assert_eq!(CacheSettings::enabled(10).policy_for("node").ttl_secs, 10);
  }
}
