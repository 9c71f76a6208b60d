use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_common::core::{DEFAULT_VIEWER_QUEUE, SessionConfig, WatchTarget};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "server_watch.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "MongoDB change stream relay for WebSocket viewers", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "WATCH_PORT", help = "Port to listen on for viewer connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "WATCH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "WATCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "WATCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "WATCH_MONGO_URI", help = "MongoDB connection string (must reach a replica set or sharded cluster).")]
    pub mongo_uri: Option<String>,

    #[clap(long, env = "WATCH_FIXED_CONTAINER", help = "Database to watch. Together with --fixed-resource the target is locked.")]
    pub fixed_container: Option<String>,

    #[clap(long, env = "WATCH_FIXED_RESOURCE", help = "Collection to watch inside --fixed-container.")]
    pub fixed_resource: Option<String>,

    #[clap(long, env = "WATCH_DEFAULT_FORMAT", help = "Display format hint passed to viewers.")]
    pub default_format: Option<String>,

    #[clap(long, env = "WATCH_DEFAULT_LAYOUT", help = "Layout hint passed to viewers.")]
    pub default_layout: Option<String>,

    #[clap(long, env = "WATCH_EXCLUDED", value_delimiter = ',', help = "Databases or db.collection names hidden from discovery.")]
    pub excluded: Option<Vec<String>>,

    #[clap(long, env = "WATCH_RETRY_DELAY_MS", help = "Fixed delay in milliseconds between reconnect attempts.")]
    pub retry_delay_ms: Option<u64>,

    #[clap(long, env = "WATCH_OPEN_TIMEOUT_MS", help = "Milliseconds allowed for opening a change stream.")]
    pub open_timeout_ms: Option<u64>,

    #[clap(long, env = "WATCH_SERVER_SELECTION_TIMEOUT_MS", help = "Milliseconds the driver spends looking for a usable server.")]
    pub server_selection_timeout_ms: Option<u64>,

    #[clap(long, env = "WATCH_VIEWER_QUEUE", help = "Messages buffered per viewer before it is dropped as too slow.")]
    pub viewer_queue: Option<usize>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    pub fn defaults() -> Config {
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            mongo_uri: Some("mongodb://localhost:27017/?replicaSet=rs0".to_string()),
            default_format: Some("json".to_string()),
            default_layout: Some("stacked".to_string()),
            excluded: Some(Vec::new()),
            retry_delay_ms: Some(5000),
            open_timeout_ms: Some(15000),
            server_selection_timeout_ms: Some(10000),
            viewer_queue: Some(DEFAULT_VIEWER_QUEUE),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            mongo_uri: other.mongo_uri.or(self.mongo_uri),
            fixed_container: other.fixed_container.or(self.fixed_container),
            fixed_resource: other.fixed_resource.or(self.fixed_resource),
            default_format: other.default_format.or(self.default_format),
            default_layout: other.default_layout.or(self.default_layout),
            excluded: other.excluded.or(self.excluded),
            retry_delay_ms: other.retry_delay_ms.or(self.retry_delay_ms),
            open_timeout_ms: other.open_timeout_ms.or(self.open_timeout_ms),
            server_selection_timeout_ms: other.server_selection_timeout_ms.or(self.server_selection_timeout_ms),
            viewer_queue: other.viewer_queue.or(self.viewer_queue),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }
}

/// Reads a JSON config file. A missing file is not an error.
pub fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str::<Config>(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(config))
}

/// Layers defaults < config file < environment/CLI.
pub fn layer_config(cli: Config) -> Result<Config> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    match read_config_file(&config_file_path)? {
        Some(file_config) => current = current.merge(file_config),
        None => eprintln!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        ),
    }

    Ok(current.merge(cli))
}

pub fn load_config() -> Result<Settings> {
    let config = layer_config(Config::parse())?;
    Settings::resolve(config)
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub mongo_uri: String,
    pub initial_target: WatchTarget,
    pub locked: bool,
    pub default_format: String,
    pub default_layout: String,
    pub excluded: Vec<String>,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
    pub server_selection_timeout: Duration,
    pub viewer_queue: usize,
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl Settings {
    pub fn resolve(config: Config) -> Result<Settings> {
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let fixed_container = non_empty(config.fixed_container);
        let fixed_resource = non_empty(config.fixed_resource);
        if fixed_resource.is_some() && fixed_container.is_none() {
            bail!("fixedResource requires fixedContainer");
        }
        let locked = fixed_container.is_some() && fixed_resource.is_some();
        let initial_target = WatchTarget::from_parts(fixed_container.as_deref(), fixed_resource.as_deref());

        let tls = match (config.tls_cert_path, config.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => bail!("tlsCertPath and tlsKeyPath must be set together"),
        };

        Ok(Settings {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(9010))),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            mongo_uri: config.mongo_uri.context("mongoUri is required")?,
            initial_target,
            locked,
            default_format: config.default_format.unwrap_or_default(),
            default_layout: config.default_layout.unwrap_or_default(),
            excluded: config
                .excluded
                .unwrap_or_default()
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            retry_delay: Duration::from_millis(config.retry_delay_ms.unwrap_or(5000)),
            open_timeout: Duration::from_millis(config.open_timeout_ms.unwrap_or(15000)),
            server_selection_timeout: Duration::from_millis(config.server_selection_timeout_ms.unwrap_or(10000)),
            viewer_queue: config.viewer_queue.unwrap_or(DEFAULT_VIEWER_QUEUE).max(1),
            tls,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            initial_target: self.initial_target.clone(),
            locked: self.locked,
            retry_delay: self.retry_delay,
            open_timeout: self.open_timeout,
            ..SessionConfig::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_resolve() {
        let settings = Settings::resolve(Config::default()).unwrap();
        assert_eq!(settings.listen_addr.port(), 9010);
        assert_eq!(settings.initial_target, WatchTarget::EntireDeployment);
        assert!(!settings.locked);
        assert_eq!(settings.retry_delay, Duration::from_secs(5));
        assert_eq!(settings.open_timeout, Duration::from_secs(15));
        assert_eq!(settings.viewer_queue, 256);
        assert!(settings.tls.is_none());
    }

    #[test]
    fn test_fixed_pair_locks_target() {
        let config = Config {
            fixed_container: Some("orders".into()),
            fixed_resource: Some("items".into()),
            ..Default::default()
        };
        let settings = Settings::resolve(config).unwrap();
        assert!(settings.locked);
        assert_eq!(settings.initial_target, WatchTarget::OneResource("orders".into(), "items".into()));
        assert!(settings.session_config().locked);
    }

    #[test]
    fn test_container_only_starts_unlocked() {
        let config = Config { fixed_container: Some("orders".into()), ..Default::default() };
        let settings = Settings::resolve(config).unwrap();
        assert!(!settings.locked);
        assert_eq!(settings.initial_target, WatchTarget::OneContainer("orders".into()));
    }

    #[test]
    fn test_invalid_combinations_are_rejected() {
        let resource_only = Config { fixed_resource: Some("items".into()), ..Default::default() };
        assert!(Settings::resolve(resource_only).is_err());

        let half_tls = Config { tls_cert_path: Some("cert.pem".into()), ..Default::default() };
        assert!(Settings::resolve(half_tls).is_err());
    }

    #[test]
    fn test_file_then_cli_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9100, "mongoUri": "mongodb://file:27017", "excluded": ["audit", "orders.secrets"], "retryDelayMs": 250}}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(9200),
            ..Default::default()
        };
        let settings = Settings::resolve(layer_config(cli).unwrap()).unwrap();

        assert_eq!(settings.listen_addr.port(), 9200);
        assert_eq!(settings.mongo_uri, "mongodb://file:27017");
        assert_eq!(settings.excluded, vec!["audit".to_string(), "orders.secrets".to_string()]);
        assert_eq!(settings.retry_delay, Duration::from_millis(250));
        assert_eq!(settings.open_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(read_config_file(file.path()).is_err());
        assert!(read_config_file(Path::new("/definitely/not/here.conf")).unwrap().is_none());
    }
}
