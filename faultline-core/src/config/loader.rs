//! # Configuration Loading
//!
//! Layers defaults, an optional TOML file, `FAULTLINE_*` environment variables
//! and programmatic overrides, in that order, into a validated
//! [`HarnessConfig`].
//!
//! Environment keys use a double underscore between path segments so that
//! field names keep their single underscores:
//! `FAULTLINE_CLUSTER__SERVER_COUNT=5` sets `cluster.server_count`.

use crate::{
    config::{schema::HarnessConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const CONFIG_NAMES: [&str; 2] = ["faultline.toml", "faultline-config.toml"];

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
    env_source: Option<Vec<(String, String)>>,
    overrides: Vec<(String, toml::Value)>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("faultline"));
        }

        Self {
            search_paths,
            explicit_file: None,
            env_prefix: "FAULTLINE".to_string(),
            env_source: None,
            overrides: Vec::new(),
        }
    }

    /// Add a search path for configuration files
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Use exactly this file instead of searching; it must exist
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Read environment overrides from the given pairs instead of the process environment
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_source = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Set a dotted key after every other source, e.g. `("cluster.server_count", 5)`
    pub fn with_override<K: Into<String>, V: Into<toml::Value>>(mut self, key: K, value: V) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Get the effective search paths being used
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Load configuration from all available sources
    pub fn load(&self) -> Result<HarnessConfig> {
        let mut config_value = toml::Value::try_from(HarnessConfig::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;

        match self.config_file()? {
            Some(path) => {
                let file_config = Self::read_file(&path)?;
                config_value = Self::merge(config_value, file_config);
                info!("Loaded configuration file: {}", path.display());
            },
            None => debug!("No configuration file found in search paths"),
        }

        for (key, raw) in self.env_overrides() {
            let parts: Vec<&str> = key.split('.').collect();
            Self::set_env_value(&mut config_value, &parts, &raw);
        }

        for (key, value) in &self.overrides {
            let parts: Vec<&str> = key.split('.').collect();
            Self::set_value(&mut config_value, &parts, value.clone());
        }

        let config: HarnessConfig = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;

        ConfigValidator::validate(&config)?;
        debug!(?config, "Configuration loaded and validated");
        Ok(config)
    }

    /// Load and validate one TOML file on top of the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HarnessConfig> {
        Self::new().with_env_vars(Vec::<(String, String)>::new()).with_file(path).load()
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(config: &HarnessConfig, path: P) -> Result<()> {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| Error::configuration(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), rendered)?;
        Ok(())
    }

    fn config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit_file {
            if !path.is_file() {
                return Err(Error::configuration(format!(
                    "Configuration file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        Ok(self
            .search_paths
            .iter()
            .flat_map(|dir| CONFIG_NAMES.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file()))
    }

    fn read_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        content.parse::<toml::Value>().map_err(|e| {
            Error::configuration(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    fn merge(mut base: toml::Value, overlay: toml::Value) -> toml::Value {
        if let (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) =
            (&mut base, overlay)
        {
            for (key, value) in overlay_table {
                match base_table.remove(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        base_table.insert(key, Self::merge(existing, value));
                    },
                    _ => {
                        base_table.insert(key, value);
                    },
                }
            }
        }
        base
    }

    /// Collect `PREFIX_SECTION__FIELD` variables as dotted lowercase keys
    fn env_overrides(&self) -> Vec<(String, String)> {
        let prefix = format!("{}_", self.env_prefix);
        let vars: Vec<(String, String)> = match &self.env_source {
            Some(vars) => vars.clone(),
            None => env::vars().collect(),
        };

        let mut collected: Vec<(String, String)> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let stripped = key.strip_prefix(&prefix)?;
                Some((stripped.to_lowercase().replace("__", "."), value))
            })
            .collect();
        collected.sort();
        debug!("Collected {} environment overrides", collected.len());
        collected
    }

    fn set_env_value(config: &mut toml::Value, parts: &[&str], raw: &str) {
        let existing = Self::lookup(config, parts);
        let value = Self::parse_env_value(raw, existing);
        Self::set_value(config, parts, value);
    }

    fn lookup<'a>(config: &'a toml::Value, parts: &[&str]) -> Option<&'a toml::Value> {
        parts.iter().try_fold(config, |node, part| node.get(*part))
    }

    fn set_value(config: &mut toml::Value, parts: &[&str], value: toml::Value) {
        let Some((last, parents)) = parts.split_last() else {
            return;
        };

        let mut node = config;
        for part in parents {
            node = match node {
                toml::Value::Table(table) => table
                    .entry(part.to_string())
                    .or_insert_with(|| toml::Value::Table(toml::map::Map::new())),
                _ => return,
            };
        }

        if let toml::Value::Table(table) = node {
            table.insert(last.to_string(), value);
        }
    }

    /// Parse an environment value, keeping strings as strings where the schema has one
    fn parse_env_value(raw: &str, existing: Option<&toml::Value>) -> toml::Value {
        if matches!(existing, Some(toml::Value::String(_))) {
            return toml::Value::String(raw.to_string());
        }
        if let Ok(value) = raw.parse::<bool>() {
            return toml::Value::Boolean(value);
        }
        if let Ok(value) = raw.parse::<i64>() {
            return toml::Value::Integer(value);
        }
        if let Ok(value) = raw.parse::<f64>() {
            return toml::Value::Float(value);
        }
        toml::Value::String(raw.to_string())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeedMode, StartMode};
    use tempfile::TempDir;

    fn isolated(dir: &TempDir) -> ConfigLoader {
        let mut loader = ConfigLoader::new().with_env_vars(Vec::<(String, String)>::new());
        loader.search_paths = vec![dir.path().to_path_buf()];
        loader
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = isolated(&dir).load().unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_file_found_in_search_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("faultline.toml"),
            "[cluster]\nserver_count = 5\nstart_mode = \"sequential\"\n",
        )
        .unwrap();

        let config = isolated(&dir).load().unwrap();
        assert_eq!(config.cluster.server_count, 5);
        assert_eq!(config.cluster.start_mode, StartMode::Sequential);
        assert_eq!(config.timeouts.run_ceiling_ms, 300_000);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("faultline.toml"), "[cluster]\nserver_count = 5\n").unwrap();

        let config = isolated(&dir)
            .with_env_vars([
                ("FAULTLINE_CLUSTER__SERVER_COUNT", "7"),
                ("FAULTLINE_CLUSTER__SEED_MODE", "cold_copy"),
                ("FAULTLINE_CLUSTER__DATABASE", "1234"),
                ("FAULTLINE_PROXY__ENABLED", "true"),
                ("OTHER_CLUSTER__SERVER_COUNT", "9"),
            ])
            .load()
            .unwrap();

        assert_eq!(config.cluster.server_count, 7);
        assert_eq!(config.cluster.seed_mode, SeedMode::ColdCopy);
        assert_eq!(config.cluster.database, "1234");
        assert!(config.proxy.enabled);
    }

    #[test]
    fn test_programmatic_override_wins() {
        let dir = TempDir::new().unwrap();
        let config = isolated(&dir)
            .with_env_vars([("FAULTLINE_CLUSTER__SERVER_COUNT", "7")])
            .with_override("cluster.server_count", 4)
            .load()
            .unwrap();
        assert_eq!(config.cluster.server_count, 4);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = isolated(&dir).with_file(dir.path().join("absent.toml")).load().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("faultline.toml"), "[cluster]\nserver_count = 2\nseed_node = 4\n")
            .unwrap();
        let err = isolated(&dir).load().unwrap_err();
        assert!(err.to_string().contains("seed_node"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = HarnessConfig::default();
        config.workload.expect_conflicts = Some(true);
        config.cluster.server_count = 4;

        ConfigLoader::save_to_file(&config, &path).unwrap();
        let loaded = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
