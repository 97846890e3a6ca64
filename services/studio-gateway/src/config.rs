//! Configuration types and loading
//!
//! The config file path comes from `--config`, then `CONFIG_PATH`, then
//! `labgen-studio.toml`. Settings missing from the file take their defaults.
//! API keys are never stored in the TOML: each pool slot names the
//! environment variable or file its secret is read from.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use gemini_client::{DEFAULT_BASE_URL, PollSettings};
use key_pool::{CredentialRecord, DEFAULT_MAX_RETRIES};
use provider::Capability;
use serde::Deserialize;

/// 32 MiB, enough for a base64 4K still.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Upper bound on configured failover retries.
const MAX_RETRIES_LIMIT: u32 = 10;

/// Root configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub pool: PoolConfig,
    pub video: VideoConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API, kept off the public listener
    pub admin_listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Request body cap. Scene stills and attachments arrive base64 encoded.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            admin_listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 256,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Upstream API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 120,
        }
    }
}

impl GeminiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Key pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_retries: u32,
    pub keys: Vec<KeySlot>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            keys: default_key_slots(),
        }
    }
}

/// One pool slot. The secret comes from `secret_env` or `secret_file`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySlot {
    pub id: String,
    pub label: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub secret_env: Option<String>,
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

/// Video polling settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        let defaults = PollSettings::default();
        Self {
            poll_interval_secs: defaults.interval.as_secs(),
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

impl VideoConfig {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn slot(id: &str, label: &str, capabilities: &[Capability], env: &str) -> KeySlot {
    KeySlot {
        id: id.to_string(),
        label: label.to_string(),
        capabilities: capabilities.to_vec(),
        secret_env: Some(env.to_string()),
        secret_file: None,
    }
}

/// Two general-purpose cores and two specialist sub-APIs.
pub fn default_key_slots() -> Vec<KeySlot> {
    vec![
        slot("primary-core", "Primary Neural Core", &Capability::ALL, "API_KEY"),
        slot(
            "secondary-core",
            "Secondary Neural Core",
            &Capability::ALL,
            "SECONDARY_API_KEY",
        ),
        slot(
            "imaging-sub-api",
            "Imaging Sub-API",
            &[Capability::Image],
            "IMAGING_API_KEY",
        ),
        slot(
            "motion-sub-api",
            "Motion Sub-API (Veo)",
            &[Capability::Video],
            "MOTION_API_KEY",
        ),
    ]
}

impl KeySlot {
    /// Resolve the slot's secret: env var first, then file, else empty.
    ///
    /// An unset or blank variable falls through to the file. A whitespace-only
    /// file yields an empty secret; an unreadable file is an error.
    pub fn resolve_secret(&self) -> common::Result<Secret<String>> {
        if let Some(var) = &self.secret_env {
            let secret = Secret::from_env(var);
            if !secret.is_blank() {
                return Ok(secret);
            }
        }
        if let Some(path) = &self.secret_file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read secret_file {} for key {}: {e}",
                    path.display(),
                    self.id
                ))
            })?;
            return Ok(Secret::new(contents.trim().to_owned()));
        }
        Ok(Secret::empty())
    }
}

impl PoolConfig {
    /// Build pool records in declaration order, resolving every secret.
    pub fn records(&self) -> common::Result<Vec<CredentialRecord>> {
        self.keys
            .iter()
            .map(|slot| {
                Ok(CredentialRecord::new(
                    slot.id.clone(),
                    slot.label.clone(),
                    slot.resolve_secret()?,
                    slot.capabilities.iter().copied(),
                ))
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let invalid = |msg: String| Err(common::Error::Config(msg));

        if !self.gemini.base_url.starts_with("http://")
            && !self.gemini.base_url.starts_with("https://")
        {
            return invalid(format!(
                "gemini.base_url must start with http:// or https://, got: {}",
                self.gemini.base_url
            ));
        }
        if self.gemini.timeout_secs == 0 {
            return invalid("gemini.timeout_secs must be greater than 0".into());
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be greater than 0".into());
        }
        if self.server.max_body_bytes == 0 {
            return invalid("server.max_body_bytes must be greater than 0".into());
        }
        if self.video.poll_interval_secs == 0 || self.video.timeout_secs == 0 {
            return invalid("video.poll_interval_secs and video.timeout_secs must be greater than 0".into());
        }
        if self.pool.max_retries > MAX_RETRIES_LIMIT {
            return invalid(format!(
                "pool.max_retries must be at most {MAX_RETRIES_LIMIT}, got: {}",
                self.pool.max_retries
            ));
        }

        let mut seen = HashSet::new();
        for slot in &self.pool.keys {
            if slot.id.trim().is_empty() {
                return invalid("pool key id must not be empty".into());
            }
            if !seen.insert(slot.id.as_str()) {
                return invalid(format!("duplicate pool key id: {}", slot.id));
            }
            if slot.capabilities.is_empty() {
                return invalid(format!("pool key {} has no capabilities", slot.id));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("labgen-studio.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("labgen-studio.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.server.admin_listen_addr.to_string(), "127.0.0.1:9090");
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.server.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.gemini.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.pool.max_retries, 2);
        assert_eq!(config.video.poll_settings(), PollSettings::default());

        let ids: Vec<_> = config.pool.keys.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(
            ids,
            ["primary-core", "secondary-core", "imaging-sub-api", "motion-sub-api"]
        );
        assert_eq!(config.pool.keys[2].capabilities, [Capability::Image]);
    }

    #[test]
    fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:18080"
max_connections = 32
max_body_bytes = 1048576

[gemini]
base_url = "http://127.0.0.1:9999/v1beta"
timeout_secs = 30

[pool]
max_retries = 3

[[pool.keys]]
id = "core"
label = "Core"
capabilities = ["text", "image", "video", "tts"]
secret_env = "LABGEN_TEST_CORE_KEY"

[video]
poll_interval_secs = 2
timeout_secs = 60
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 32);
        assert_eq!(config.server.max_body_bytes, 1024 * 1024);
        assert_eq!(config.gemini.timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.max_retries, 3);
        assert_eq!(config.pool.keys.len(), 1);
        assert_eq!(config.pool.keys[0].capabilities, Capability::ALL);
        assert_eq!(config.video.poll_settings().interval, Duration::from_secs(2));
    }

    #[test]
    fn load_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/labgen-studio.toml")).is_err());
    }

    #[test]
    fn load_invalid_toml() {
        let err = Config::parse("not valid {{{{ toml").unwrap_err();
        assert!(matches!(err, common::Error::Toml(_)));
    }

    #[test]
    fn unknown_capability_rejected() {
        let result = Config::parse(
            r#"
[[pool.keys]]
id = "a"
label = "A"
capabilities = ["music"]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_key_ids_rejected() {
        let err = Config::parse(
            r#"
[[pool.keys]]
id = "a"
label = "A"
capabilities = ["text"]

[[pool.keys]]
id = "a"
label = "A again"
capabilities = ["image"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate pool key id: a"));
    }

    #[test]
    fn key_without_capabilities_rejected() {
        let err = Config::parse(
            r#"
[[pool.keys]]
id = "a"
label = "A"
capabilities = []
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no capabilities"));
    }

    #[test]
    fn invalid_base_url_rejected() {
        let err = Config::parse("[gemini]\nbase_url = \"generativelanguage.googleapis.com\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("base_url must start with http"));
    }

    #[test]
    fn zero_values_rejected() {
        assert!(Config::parse("[server]\nmax_connections = 0\n").is_err());
        assert!(Config::parse("[server]\nmax_body_bytes = 0\n").is_err());
        assert!(Config::parse("[gemini]\ntimeout_secs = 0\n").is_err());
        assert!(Config::parse("[video]\npoll_interval_secs = 0\n").is_err());
    }

    #[test]
    fn excessive_retries_rejected() {
        assert!(Config::parse("[pool]\nmax_retries = 11\n").is_err());
        assert!(Config::parse("[pool]\nmax_retries = 10\n").is_ok());
    }

    #[test]
    fn secret_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("LABGEN_TEST_SLOT_ENV", "  AIza-env  ") };
        let slot = slot("a", "A", &Capability::ALL, "LABGEN_TEST_SLOT_ENV");
        assert!(slot.resolve_secret().unwrap().matches("AIza-env"));
        unsafe { remove_env("LABGEN_TEST_SLOT_ENV") };
    }

    #[test]
    fn unset_env_yields_empty_secret() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("LABGEN_TEST_SLOT_UNSET") };
        let slot = slot("a", "A", &Capability::ALL, "LABGEN_TEST_SLOT_UNSET");
        assert!(slot.resolve_secret().unwrap().is_blank());
    }

    #[test]
    fn secret_from_file_when_env_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("imaging");
        std::fs::write(&key_path, "AIza-file\n").unwrap();
        unsafe { remove_env("LABGEN_TEST_SLOT_FILE") };

        let mut slot = slot("img", "Img", &[Capability::Image], "LABGEN_TEST_SLOT_FILE");
        slot.secret_file = Some(key_path);
        assert!(slot.resolve_secret().unwrap().matches("AIza-file"));
    }

    #[test]
    fn env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, "AIza-file").unwrap();
        unsafe { set_env("LABGEN_TEST_SLOT_BOTH", "AIza-env") };

        let mut slot = slot("a", "A", &Capability::ALL, "LABGEN_TEST_SLOT_BOTH");
        slot.secret_file = Some(key_path);
        assert!(slot.resolve_secret().unwrap().matches("AIza-env"));
        unsafe { remove_env("LABGEN_TEST_SLOT_BOTH") };
    }

    #[test]
    fn whitespace_file_yields_empty_secret() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, "  \n  ").unwrap();

        let slot = KeySlot {
            id: "a".into(),
            label: "A".into(),
            capabilities: vec![Capability::Text],
            secret_env: None,
            secret_file: Some(key_path),
        };
        assert!(slot.resolve_secret().unwrap().is_blank());
    }

    #[test]
    fn unreadable_secret_file_is_error() {
        let slot = KeySlot {
            id: "a".into(),
            label: "A".into(),
            capabilities: vec![Capability::Text],
            secret_env: None,
            secret_file: Some(PathBuf::from("/nonexistent/secret")),
        };
        let err = slot.resolve_secret().unwrap_err();
        assert!(err.to_string().contains("failed to read secret_file"));
    }

    #[test]
    fn records_keep_declaration_order() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("LABGEN_TEST_RECORDS_A", "k-a") };
        unsafe { remove_env("LABGEN_TEST_RECORDS_B") };
        let pool = PoolConfig {
            max_retries: 2,
            keys: vec![
                slot("a", "A", &Capability::ALL, "LABGEN_TEST_RECORDS_A"),
                slot("b", "B", &[Capability::Video], "LABGEN_TEST_RECORDS_B"),
            ],
        };

        let records = pool.records().unwrap();
        assert_eq!(records[0].id(), "a");
        assert!(records[0].is_configured());
        assert_eq!(records[1].id(), "b");
        assert!(!records[1].is_configured());
        assert!(records[1].supports(Capability::Video));
        unsafe { remove_env("LABGEN_TEST_RECORDS_A") };
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("labgen-studio.toml"));

        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
