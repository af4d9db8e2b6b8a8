use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "GENVID_DATA_DIR";

pub const ENV_SERVER_HOST: &str = "SERVER_NAME";
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";
pub const ENV_STORE_HOST: &str = "REDIS_HOST";
pub const ENV_STORE_PORT: &str = "REDIS_PORT";
pub const ENV_MODEL_BASE: &str = "MODEL_BASE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    /// Lifetime of a claim before the store expires it on its own. Safety
    /// net against claims leaked by a crashed process.
    pub claim_ttl_secs: u64,
    /// When true, reject new jobs while the store is unreachable instead of
    /// admitting them unchecked.
    pub fail_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory holding the model weights. Checked at startup.
    pub model_base: PathBuf,
    /// Sampler worker binary invoked once per generation job.
    pub worker_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub results_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            claim_ttl_secs: 3600,
            fail_closed: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_base: PathBuf::from("models"),
            worker_command: "genvid-worker".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
        }
    }
}

impl StoreConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Fold process environment variables over file-loaded values. Values
    /// that fail to parse are ignored, keeping whatever the file supplied.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var(ENV_SERVER_HOST) {
            if !host.trim().is_empty() {
                self.server.host = host;
            }
        }
        if let Some(port) = env_port(ENV_SERVER_PORT) {
            self.server.port = port;
        }
        if let Ok(host) = env::var(ENV_STORE_HOST) {
            if !host.trim().is_empty() {
                self.store.host = host;
            }
        }
        if let Some(port) = env_port(ENV_STORE_PORT) {
            self.store.port = port;
        }
        if let Some(model_base) = env::var_os(ENV_MODEL_BASE) {
            if !model_base.is_empty() {
                self.engine.model_base = PathBuf::from(model_base);
            }
        }
    }
}

fn env_port(name: &str) -> Option<u16> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. GENVID_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    // Create data directory
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    // Write default config if doesn't exist
    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.port, 5000);

        assert_eq!(cfg.store.host, "localhost");
        assert_eq!(cfg.store.port, 6379);
        assert_eq!(cfg.store.claim_ttl_secs, 3600);
        assert!(!cfg.store.fail_closed);

        assert_eq!(cfg.engine.model_base, PathBuf::from("models"));
        assert_eq!(cfg.engine.worker_command, "genvid-worker");
        assert_eq!(cfg.paths.results_dir, PathBuf::from("results"));
    }

    #[test]
    fn redis_url_joins_host_and_port() {
        let store = StoreConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            ..StoreConfig::default()
        };
        assert_eq!(store.redis_url(), "redis://cache.internal:6380/");
        assert_eq!(store.claim_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let decoded: AppConfig =
            toml::from_str("[server]\nport = 8080\n").expect("deserialize partial config");
        assert_eq!(decoded.server.port, 8080);
        assert_eq!(decoded.server.host, "0.0.0.0");
        assert_eq!(decoded.store.port, 6379);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let path = unique_temp_config_path();
        let loaded = AppConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        env::set_var(ENV_SERVER_HOST, "127.0.0.1");
        env::set_var(ENV_SERVER_PORT, "5050");
        env::set_var(ENV_STORE_HOST, "redis.internal");
        env::set_var(ENV_STORE_PORT, "not-a-port");
        env::set_var(ENV_MODEL_BASE, "/srv/weights");

        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides();

        env::remove_var(ENV_SERVER_HOST);
        env::remove_var(ENV_SERVER_PORT);
        env::remove_var(ENV_STORE_HOST);
        env::remove_var(ENV_STORE_PORT);
        env::remove_var(ENV_MODEL_BASE);

        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 5050);
        assert_eq!(cfg.store.host, "redis.internal");
        assert_eq!(cfg.store.port, 6379);
        assert_eq!(cfg.engine.model_base, PathBuf::from("/srv/weights"));
    }

    #[test]
    fn data_dir_resolution_order() {
        let cli_path = Path::new("/custom");
        assert_eq!(data_dir(Some(cli_path)), PathBuf::from("/custom"));

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(from_env, PathBuf::from("/env/path"));

        assert_eq!(data_dir(None), PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = unique_temp_dir();
        initialize_data_dir(&temp).expect("initialize data dir");

        assert!(temp.exists());
        assert!(temp.join("config.toml").exists());

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = unique_temp_dir();
        fs::create_dir_all(&temp).expect("create temp dir");

        let cfg_path = temp.join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&temp).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);

        fs::remove_dir_all(&temp).ok();
    }

    fn unique_temp_config_path() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "genvid-config-test-{}-{timestamp}.toml",
            std::process::id()
        ))
    }

    fn unique_temp_dir() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "genvid-config-test-{}-{timestamp}",
            std::process::id()
        ))
    }
}
