//! Configuration for the cache host, update coordinator and release tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cache Controller configuration: bucket naming, precache list and routing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix shared by every cache bucket this application owns.
    pub prefix: String,
    /// Assets fetched into a new cache generation on install.
    pub precache: Vec<String>,
    /// Well-known path of the version manifest.
    pub manifest_path: String,
    /// Same-origin path prefixes that belong to the internal API.
    pub api_prefixes: Vec<String>,
    /// Hosts of the external data service (matched exactly or as a parent domain).
    pub data_service_hosts: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "detailer-".to_string(),
            precache: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/icon-192.svg".to_string(),
            ],
            manifest_path: "/version.json".to_string(),
            api_prefixes: vec!["/api/".to_string()],
            data_service_hosts: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bucket name prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replaces the precache list.
    #[must_use]
    pub fn with_precache(mut self, precache: Vec<String>) -> Self {
        self.precache = precache;
        self
    }

    /// Adds an external data-service host that is never intercepted.
    #[must_use]
    pub fn with_data_service_host(mut self, host: impl Into<String>) -> Self {
        self.data_service_hosts.push(host.into());
        self
    }
}

/// Update Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// URL of the version manifest as seen from the page.
    pub manifest_url: String,
    /// Seconds between background update checks.
    pub poll_interval_secs: u64,
    /// Upper bound, in milliseconds, between the activation message and the reload.
    pub reload_delay_ms: u64,
    /// Local development mode: background polling is disabled.
    pub dev_mode: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            manifest_url: "http://127.0.0.1:9723/version.json".to_string(),
            poll_interval_secs: 5 * 60,
            reload_delay_ms: 500,
            dev_mode: false,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval between background update checks.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Maximum wait between sending the activation message and reloading.
    #[must_use]
    pub const fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    /// Sets the manifest URL.
    #[must_use]
    pub fn with_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.manifest_url = url.into();
        self
    }

    /// Sets the reload delay in milliseconds.
    #[must_use]
    pub const fn with_reload_delay_ms(mut self, millis: u64) -> Self {
        self.reload_delay_ms = millis;
        self
    }

    /// Sets the polling interval in seconds.
    #[must_use]
    pub const fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Enables or disables development mode.
    #[must_use]
    pub const fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }
}

/// Path configuration for durable state, cache buckets and served assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory holding the durable client store.
    pub state_dir: PathBuf,
    /// Directory holding one subdirectory per cache bucket.
    pub cache_dir: PathBuf,
    /// Directory served by the static origin.
    pub public_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            state_dir: default_state_dir(),
            cache_dir: cache_dir.join("detailer-pwa").join("buckets"),
            public_dir: PathBuf::from("public"),
        }
    }
}

/// Returns the directory where durable client state is stored.
///
/// Uses `STATE_DIRECTORY` (set by systemd when `StateDirectory=` is configured),
/// falling back to `$XDG_DATA_HOME/detailer-pwa` for interactive use.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    std::env::var("STATE_DIRECTORY").map_or_else(
        |_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("detailer-pwa")
        },
        PathBuf::from,
    )
}

/// Host proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Proxy bind address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Origin the proxy fronts; also the worker scope.
    pub origin: String,
    /// Path of the worker script on the origin.
    pub worker_script: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9723,
            origin: "http://127.0.0.1:8080".to_string(),
            worker_script: "/sw.js".to_string(),
        }
    }
}

/// Files rewritten by the release tool, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Package descriptor carrying the canonical version.
    pub package_file: PathBuf,
    /// Version manifest served to clients.
    pub manifest_file: PathBuf,
    /// Source file exporting the client version constant.
    pub version_file: PathBuf,
    /// Worker script carrying the cache generation tag.
    pub worker_file: PathBuf,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            package_file: PathBuf::from("package.json"),
            manifest_file: PathBuf::from("public/version.json"),
            version_file: PathBuf::from("src/lib/version.ts"),
            worker_file: PathBuf::from("public/sw.js"),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache Controller configuration.
    pub cache: CacheConfig,
    /// Update Coordinator configuration.
    pub coordinator: CoordinatorConfig,
    /// Path configuration.
    pub paths: PathConfig,
    /// Host proxy configuration.
    pub server: ServerConfig,
    /// Release tool configuration.
    pub release: ReleaseConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("detailer-pwa")
            .join("config.toml")
    }

    /// Loads configuration from `path`, writing a default template first if
    /// the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created.
    pub fn load_or_create(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            log::info!("Wrote default configuration to {}", path.display());
            return Ok(config);
        }
        Self::load(path)
    }

    /// Loads configuration from an existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Saves configuration to disk atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_config() {
        let config = CacheConfig::default();
        assert_eq!(config.prefix, "detailer-");
        assert_eq!(config.precache, vec!["/", "/manifest.json", "/icon-192.svg"]);
        assert_eq!(config.manifest_path, "/version.json");
        assert!(config.data_service_hosts.is_empty());
    }

    #[test]
    fn cache_config_builder_pattern() {
        let config = CacheConfig::new()
            .with_prefix("shop-")
            .with_precache(vec!["/".to_string()])
            .with_data_service_host("example.supabase.co");

        assert_eq!(config.prefix, "shop-");
        assert_eq!(config.precache, vec!["/"]);
        assert_eq!(config.data_service_hosts, vec!["example.supabase.co"]);
    }

    #[test]
    fn default_coordinator_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.reload_delay(), Duration::from_millis(500));
        assert!(!config.dev_mode);
    }

    #[test]
    fn coordinator_config_builder_pattern() {
        let config = CoordinatorConfig::new()
            .with_manifest_url("http://localhost/version.json")
            .with_reload_delay_ms(20)
            .with_poll_interval_secs(1)
            .with_dev_mode(true);

        assert_eq!(config.manifest_url, "http://localhost/version.json");
        assert_eq!(config.reload_delay(), Duration::from_millis(20));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.dev_mode);
    }

    #[test]
    fn app_config_serializes_to_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let loaded: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(loaded.cache.prefix, config.cache.prefix);
        assert_eq!(loaded.server.port, 9723);
        assert_eq!(loaded.release.worker_file, PathBuf::from("public/sw.js"));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let loaded: AppConfig = toml::from_str(
            r#"
            [server]
            port = 8000

            [coordinator]
            dev_mode = true
            "#,
        )
        .unwrap();
        assert_eq!(loaded.server.port, 8000);
        assert_eq!(loaded.server.host, "127.0.0.1");
        assert!(loaded.coordinator.dev_mode);
        assert_eq!(loaded.coordinator.reload_delay_ms, 500);
    }

    #[test]
    fn load_or_create_writes_template() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = AppConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.cache.prefix, "detailer-");

        let loaded = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(loaded.server.origin, created.server.origin);
    }
}
