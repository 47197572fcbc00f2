use crate::dialect::{strip_jdbc, Dialect};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Process-wide settings, read from `typewriter.toml` plus `TYPEWRITER_*` variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypewriterConfig {
    /// Default delay for `save_lazily_default`, in milliseconds
    pub debounce_ms: u64,
    /// Rows fetched per round trip by cursors
    pub page_size: usize,
    /// Queued entities that force a lazy bulk flush
    pub bulk_max: usize,
    /// Delay before a lazy bulk flush, in milliseconds
    pub bulk_delay_ms: u64,
    /// Default connection URL per dialect key
    pub locations: BTreeMap<String, String>,
}

impl Default for TypewriterConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            page_size: 256,
            bulk_max: 250,
            bulk_delay_ms: 15_000,
            locations: BTreeMap::new(),
        }
    }
}

impl TypewriterConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn bulk_delay(&self) -> Duration {
        Duration::from_millis(self.bulk_delay_ms)
    }

    pub fn location_for(&self, dialect: Dialect) -> Option<&str> {
        self.locations.get(dialect.as_str()).map(String::as_str)
    }

    /// Overlay `TYPEWRITER_*` environment variables
    pub fn apply_env(self) -> Self {
        self.apply_vars(std::env::vars())
    }

    fn apply_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("TYPEWRITER_") else {
                continue;
            };
            match name {
                "DEBOUNCE_MS" => parse_into(&key, &value, &mut self.debounce_ms),
                "PAGE_SIZE" => parse_into(&key, &value, &mut self.page_size),
                "BULK_MAX" => parse_into(&key, &value, &mut self.bulk_max),
                "BULK_DELAY_MS" => parse_into(&key, &value, &mut self.bulk_delay_ms),
                other => {
                    if let Some(dialect) = other.strip_suffix("_URL").and_then(|d| d.parse::<Dialect>().ok()) {
                        self.locations.insert(dialect.as_str().to_string(), value);
                    }
                }
            }
        }
        self
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("ignoring {}={:?}: not a number", key, value),
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("typewriter.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<TypewriterConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: TypewriterConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

static CURRENT: OnceLock<TypewriterConfig> = OnceLock::new();

/// Install the process-wide configuration; false if one is already in effect
pub fn install(config: TypewriterConfig) -> bool {
    CURRENT.set(config).is_ok()
}

/// The process-wide configuration; defaults to `typewriter.toml` plus environment
pub fn current() -> &'static TypewriterConfig {
    CURRENT.get_or_init(|| {
        let base = match load_config(None) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                warn!("ignoring unreadable {}: {}", default_config_path().display(), e);
                TypewriterConfig::default()
            }
        };
        base.apply_env()
    })
}

/// Which backend an executor talks to.
///
/// Executors are cached per (entity type, resolved location, logical name).
/// `name` overrides the table or collection name derived from the entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendConfig {
    pub dialect: Dialect,
    pub location: Option<String>,
    pub name: Option<String>,
}

impl BackendConfig {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect, location: None, name: None }
    }

    /// Backend for a URL, with the dialect taken from its scheme
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(Dialect::from_url(url)?).at(url))
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Explicit location, else the configured one, else the dialect default
    pub fn resolved_location(&self) -> Result<String> {
        let location = self
            .location
            .as_deref()
            .or_else(|| current().location_for(self.dialect))
            .unwrap_or_else(|| self.dialect.default_location());
        let location = strip_jdbc(location);
        let scheme_dialect = Dialect::from_url(location)?;
        if scheme_dialect != self.dialect {
            return Err(Error::MalformedConfiguration(format!(
                "{} URL [{}] configured for {}",
                scheme_dialect, location, self.dialect
            )));
        }
        Ok(location.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TypewriterConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.bulk_max, 250);
        assert_eq!(config.bulk_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_load_config_from_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("typewriter.toml");
        std::fs::write(
            &path,
            "debounce_ms = 40\n\n[locations]\nsqlite = \"sqlite:mem:configured\"\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(config.debounce_ms, 40);
        assert_eq!(config.page_size, 256);
        assert_eq!(config.location_for(Dialect::Sqlite), Some("sqlite:mem:configured"));

        assert!(load_config(Some(&dir.path().join("missing.toml"))).unwrap().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("TYPEWRITER_DEBOUNCE_MS".to_string(), "75".to_string()),
            ("TYPEWRITER_PAGE_SIZE".to_string(), "lots".to_string()),
            ("TYPEWRITER_POSTGRESQL_URL".to_string(), "postgresql://db:5432/app".to_string()),
            ("UNRELATED".to_string(), "1".to_string()),
        ];
        let config = TypewriterConfig::default().apply_vars(vars);
        assert_eq!(config.debounce_ms, 75);
        assert_eq!(config.page_size, 256);
        assert_eq!(config.location_for(Dialect::Postgres), Some("postgresql://db:5432/app"));
    }

    #[test]
    fn test_backend_location_resolution() {
        let explicit = BackendConfig::new(Dialect::Sqlite).at("jdbc:sqlite:mem:x");
        assert_eq!(explicit.resolved_location().unwrap(), "sqlite:mem:x");

        let mismatched = BackendConfig::new(Dialect::Postgres).at("sqlite:mem:x");
        assert!(matches!(
            mismatched.resolved_location(),
            Err(Error::MalformedConfiguration(_))
        ));

        let from_url = BackendConfig::from_url("mongodb:mem:people").unwrap();
        assert_eq!(from_url.dialect, Dialect::Mongo);
    }
}
