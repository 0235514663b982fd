use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// How the external playlist generator is launched.
///
/// The run arguments built from the user's selection are appended after
/// `base_args`, so `program = "python3"`, `base_args = ["main.py"]` yields
/// `python3 main.py -s songs.csv -d 30 -u 120`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_base_args")]
    pub base_args: Vec<String>,
    /// Working directory for the child process. Inherits ours when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Where the generator writes its progress log and completion sentinel, and
/// how often we look at them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_done_file")]
    pub done_file: PathBuf,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Upper bound on how long we wait for the done file before giving up.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// How long to keep polling after the generator exited without creating
    /// the done file.
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
    /// Remove a done file left over from a previous run before starting.
    #[serde(default = "default_clear_stale_done")]
    pub clear_stale_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// Parsing generator output is not supported yet; every successful run
    /// ends with a distinguishable "not implemented" outcome.
    #[default]
    Pending,
    /// The generator's playlist JSON document.
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default)]
    pub kind: ParserKind,
    /// Read the playlist document from this file instead of stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_file: Option<PathBuf>,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    /// Point both the log and the done file at `dir/log.txt` and `dir/done.txt`.
    pub fn with_log_dir(mut self, dir: &Path) -> Self {
        self.log_file = dir.join("log.txt");
        self.done_file = dir.join("done.txt");
        self
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            base_args: default_base_args(),
            working_dir: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            done_file: default_done_file(),
            interval_ms: default_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
            exit_grace_ms: default_exit_grace_ms(),
            clear_stale_done: default_clear_stale_done(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_program() -> String {
    #[cfg(windows)]
    return "python.exe".to_string();

    #[cfg(not(windows))]
    return "python3".to_string();
}

fn default_base_args() -> Vec<String> {
    vec!["main.py".to_string()]
}

fn default_log_file() -> PathBuf {
    platform::generator_log_dir().join("log.txt")
}

fn default_done_file() -> PathBuf {
    platform::generator_log_dir().join("done.txt")
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_wait_secs() -> u64 {
    30 * 60
}

fn default_exit_grace_ms() -> u64 {
    2000
}

fn default_clear_stale_done() -> bool {
    true
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing the defaults there first when the
    /// file does not exist yet.
    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 9797);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.polling.interval(), Duration::from_secs(1));
        assert_eq!(config.polling.max_wait(), Duration::from_secs(1800));
        assert!(config.polling.clear_stale_done);
        assert_eq!(config.polling.exit_grace(), Duration::from_secs(2));
        assert!(config.polling.log_file.ends_with("log.txt"));
        assert!(config.polling.done_file.ends_with("done.txt"));
        assert_eq!(config.parser.kind, ParserKind::Pending);
        assert_eq!(config.generator.base_args, vec!["main.py".to_string()]);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [generator]
            program = "/usr/bin/python3"

            [polling]
            interval_ms = 250

            [parser]
            kind = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.generator.program, "/usr/bin/python3");
        assert_eq!(config.generator.base_args, vec!["main.py".to_string()]);
        assert_eq!(config.polling.interval(), Duration::from_millis(250));
        assert_eq!(config.polling.max_wait_secs, 1800);
        assert_eq!(config.parser.kind, ParserKind::Json);
        assert!(config.parser.playlist_file.is_none());
    }

    #[test]
    fn test_load_from_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, 9797);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.polling.log_file, config.polling.log_file);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let polling = PollingConfig {
            interval_ms: 0,
            ..PollingConfig::default()
        };
        assert_eq!(polling.interval(), Duration::from_millis(1));
    }
}
