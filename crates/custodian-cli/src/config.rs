//! Configuration Vault – reads/writes `~/.custodian/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use custodian_middleware::ConnectionConfig;
use custodian_runtime::{AgentConfig, ReporterConfig};
use zeroize::Zeroize;

/// Persisted agent configuration stored in `~/.custodian/config.toml`.
///
/// An empty `controller_url` runs the agent offline against an in-process
/// controller; an empty `fallback_url` disables the request/response
/// fallback channel.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket endpoint of the management controller.
    #[serde(default)]
    pub controller_url: String,

    /// HTTP endpoint used while the primary channel is unavailable.
    #[serde(default)]
    pub fallback_url: String,

    /// Stable identity presented to the controller.
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Display name used until the operator renames the device.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// SQLite state file.  Empty means `state.db` next to the config file.
    #[serde(default)]
    pub state_db: String,

    /// Bearer token presented on connect.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub enrollment_token: String,

    /// Stored as the admin password on first start only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initial_admin_password: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    /// Longest stretch without a device snapshot before a keep-alive is sent.
    #[serde(default = "default_max_silence_secs")]
    pub max_silence_secs: u64,

    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    /// Packages reported as installed by the simulated device.
    #[serde(default = "default_simulated_packages")]
    pub simulated_packages: Vec<String>,
}

impl Drop for Config {
    fn drop(&mut self) {
        self.enrollment_token.zeroize();
        self.initial_admin_password.zeroize();
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("controller_url", &self.controller_url)
            .field("fallback_url", &self.fallback_url)
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("state_db", &self.state_db)
            .field("enrollment_token", redacted(&self.enrollment_token))
            .field("initial_admin_password", redacted(&self.initial_admin_password))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("ping_interval_secs", &self.ping_interval_secs)
            .field("report_interval_secs", &self.report_interval_secs)
            .field("max_silence_secs", &self.max_silence_secs)
            .field("queue_max_size", &self.queue_max_size)
            .field("simulated_packages", &self.simulated_packages)
            .finish()
    }
}

fn redacted(secret: &str) -> &'static &'static str {
    if secret.is_empty() { &"<not set>" } else { &"<redacted>" }
}

fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_device_name() -> String {
    "custodian-device".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_report_interval_secs() -> u64 {
    30
}
fn default_max_silence_secs() -> u64 {
    15 * 60
}
fn default_queue_max_size() -> usize {
    custodian_middleware::queue::DEFAULT_MAX_SIZE
}
fn default_simulated_packages() -> Vec<String> {
    ["com.example.mail", "com.example.maps", "com.example.browser"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_url: String::new(),
            fallback_url: String::new(),
            device_id: default_device_id(),
            device_name: default_device_name(),
            state_db: String::new(),
            enrollment_token: String::new(),
            initial_admin_password: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            report_interval_secs: default_report_interval_secs(),
            max_silence_secs: default_max_silence_secs(),
            queue_max_size: default_queue_max_size(),
            simulated_packages: default_simulated_packages(),
        }
    }
}

impl Config {
    /// `true` when no controller is configured.
    pub fn is_offline(&self) -> bool {
        self.controller_url.trim().is_empty()
    }

    /// Resolve the state database path relative to the config file.
    pub fn state_db_path(&self, config_file: &Path) -> PathBuf {
        if !self.state_db.trim().is_empty() {
            return PathBuf::from(self.state_db.trim());
        }
        config_file
            .parent()
            .map(|dir| dir.join("state.db"))
            .unwrap_or_else(|| PathBuf::from("state.db"))
    }

    /// Map the persisted settings onto the runtime's configuration.
    pub fn to_agent_config(&self) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            device_name: self.device_name.clone(),
            initial_admin_password: Some(self.initial_admin_password.clone())
                .filter(|p| !p.is_empty()),
            queue_max_size: self.queue_max_size.max(1),
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
                ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
                ..ConnectionConfig::default()
            },
            reporter: ReporterConfig {
                period: Duration::from_secs(self.report_interval_secs.max(1)),
                max_silence: Duration::from_secs(self.max_silence_secs),
            },
            ..defaults
        }
    }
}

/// Return the path to `~/.custodian/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".custodian").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `CUSTODIAN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CUSTODIAN_CONTROLLER_URL` | `controller_url` |
/// | `CUSTODIAN_FALLBACK_URL` | `fallback_url` |
/// | `CUSTODIAN_DEVICE_ID` | `device_id` |
/// | `CUSTODIAN_STATE_DB` | `state_db` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CUSTODIAN_CONTROLLER_URL") {
        cfg.controller_url = v;
    }
    if let Ok(v) = std::env::var("CUSTODIAN_FALLBACK_URL") {
        cfg.fallback_url = v;
    }
    if let Ok(v) = std::env::var("CUSTODIAN_DEVICE_ID")
        && !v.trim().is_empty()
    {
        cfg.device_id = v;
    }
    if let Ok(v) = std::env::var("CUSTODIAN_STATE_DB") {
        cfg.state_db = v;
    }
}

/// Save the config to disk, creating `~/.custodian/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix; the file holds the enrollment token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let mut cfg = Config::default();
        cfg.enrollment_token = "tok-super-secret".to_string();
        cfg.initial_admin_password = "hunter2".to_string();
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("tok-super-secret"));
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_secrets() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);

        let parent = path.parent().expect("config dir");
        let dir_mode = std::fs::metadata(parent).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_device_id_and_secrets() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.enrollment_token = "tok".to_string();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.device_id, cfg.device_id);
        assert_eq!(loaded.enrollment_token, "tok");
        assert_eq!(loaded.report_interval_secs, 30);
        assert_eq!(loaded.max_silence_secs, 900);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "device_name = \"lobby\"\n").expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.device_name, "lobby");
        assert_eq!(loaded.queue_max_size, 500);
        assert!(!loaded.device_id.is_empty());
        assert_eq!(loaded.simulated_packages.len(), 3);
    }

    #[test]
    fn config_path_points_to_custodian_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".custodian"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn state_db_defaults_next_to_config_file() {
        let mut cfg = Config::default();
        let file = Path::new("/home/u/.custodian/config.toml");
        assert_eq!(cfg.state_db_path(file), PathBuf::from("/home/u/.custodian/state.db"));
        cfg.state_db = "/var/lib/custodian/state.db".to_string();
        assert_eq!(cfg.state_db_path(file), PathBuf::from("/var/lib/custodian/state.db"));
    }

    #[test]
    fn agent_config_carries_settings() {
        let mut cfg = Config::default();
        cfg.device_name = "lobby".to_string();
        cfg.initial_admin_password = "pw".to_string();
        cfg.report_interval_secs = 5;
        cfg.connect_timeout_secs = 3;

        let agent = cfg.to_agent_config();
        assert_eq!(agent.device_name, "lobby");
        assert_eq!(agent.initial_admin_password.as_deref(), Some("pw"));
        assert_eq!(agent.reporter.period, Duration::from_secs(5));
        assert_eq!(agent.connection.connect_timeout, Duration::from_secs(3));

        assert!(Config::default().to_agent_config().initial_admin_password.is_none());
    }

    #[test]
    fn empty_controller_url_means_offline() {
        let mut cfg = Config::default();
        assert!(cfg.is_offline());
        cfg.controller_url = "wss://mdm.example.com/agent".to_string();
        assert!(!cfg.is_offline());
    }

    #[test]
    fn apply_env_overrides_changes_controller_and_state_db() {
        // SAFETY: only this test touches these variables.
        unsafe {
            std::env::set_var("CUSTODIAN_CONTROLLER_URL", "wss://ctl.example:9443/agent");
            std::env::set_var("CUSTODIAN_STATE_DB", "/tmp/custodian-test.db");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.controller_url, "wss://ctl.example:9443/agent");
        assert_eq!(cfg.state_db, "/tmp/custodian-test.db");
        unsafe {
            std::env::remove_var("CUSTODIAN_CONTROLLER_URL");
            std::env::remove_var("CUSTODIAN_STATE_DB");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_blank_device_id() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("CUSTODIAN_DEVICE_ID", "  ") };
        let mut cfg = Config::default();
        let original = cfg.device_id.clone();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.device_id, original);
        unsafe { std::env::remove_var("CUSTODIAN_DEVICE_ID") };
    }
}
