use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const DEFAULT_CONFIG_FILE: &str = "shared-worker.toml";
const SUPPORTED_TRACE_MODES: &[&str] = &["none", "rolling", "full"];

// ── Top-level config ──────────────────────────────────────────────

/// Shared-worker host configuration, loaded from `shared-worker.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path the config was loaded from - not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Protocol the framework requires plugins to support (`[protocol]`).
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Envelope trace storage (`[trace]`).
    #[serde(default)]
    pub trace: TraceConfig,

    /// Plugins launched as child processes, keyed by plugin filename
    /// (`[plugins."<filename>"]`). Filenames not listed here are looked up in
    /// the in-process plugin catalog.
    #[serde(default)]
    pub plugins: HashMap<String, PluginProcessConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            protocol: ProtocolConfig::default(),
            trace: TraceConfig::default(),
            plugins: HashMap::new(),
        }
    }
}

// ── Protocol ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolConfig {
    /// Required protocol version. Default: `"v2"`.
    #[serde(default = "default_protocol_version")]
    pub version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: default_protocol_version(),
        }
    }
}

fn default_protocol_version() -> String {
    crate::protocol::DEFAULT_PROTOCOL.to_string()
}

// ── Envelope trace ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TraceConfig {
    /// Storage mode: "none" | "rolling" | "full".
    #[serde(default = "default_trace_mode")]
    pub mode: String,

    /// Trace file path. Relative paths are resolved next to the config file.
    #[serde(default = "default_trace_path")]
    pub path: String,

    /// Maximum entries retained when mode = "rolling".
    #[serde(default = "default_trace_max_entries")]
    pub max_entries: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            mode: default_trace_mode(),
            path: default_trace_path(),
            max_entries: default_trace_max_entries(),
        }
    }
}

fn default_trace_mode() -> String {
    "none".to_string()
}

fn default_trace_path() -> String {
    "state/envelope-trace.jsonl".to_string()
}

fn default_trace_max_entries() -> usize {
    1000
}

// ── Plugin processes ──────────────────────────────────────────────

/// How to launch one plugin as a child process speaking envelopes on stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PluginProcessConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Read and parse a config file. Environment overrides and validation
    /// are separate steps.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.config_path = path.to_path_buf();
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Protocol
        let version = self.protocol.version.trim();
        if version.is_empty() {
            anyhow::bail!("protocol.version must not be empty");
        }
        if version.chars().any(char::is_whitespace) {
            anyhow::bail!("protocol.version must not contain whitespace");
        }

        // Trace
        let mode = self.trace.mode.trim().to_ascii_lowercase();
        if !SUPPORTED_TRACE_MODES.contains(&mode.as_str()) {
            anyhow::bail!(
                "trace.mode is invalid ({}); expected one of: {}",
                self.trace.mode,
                SUPPORTED_TRACE_MODES.join(", ")
            );
        }
        if mode != "none" && self.trace.path.trim().is_empty() {
            anyhow::bail!("trace.path must not be empty when tracing is enabled");
        }
        if mode == "rolling" && self.trace.max_entries == 0 {
            anyhow::bail!("trace.max_entries must be greater than 0");
        }

        // Plugins
        for (filename, plugin) in &self.plugins {
            if filename.trim().is_empty() {
                anyhow::bail!("plugins keys must not be empty");
            }
            if plugin.command.trim().is_empty() {
                anyhow::bail!("plugins.\"{filename}\".command must not be empty");
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(version) = lookup("SHARED_WORKER_PROTOCOL").filter(|v| !v.trim().is_empty()) {
            self.protocol.version = version.trim().to_string();
        }
        if let Some(mode) = lookup("SHARED_WORKER_TRACE_MODE").filter(|v| !v.trim().is_empty()) {
            self.trace.mode = mode.trim().to_ascii_lowercase();
        }
        if let Some(path) = lookup("SHARED_WORKER_TRACE_PATH").filter(|v| !v.trim().is_empty()) {
            self.trace.path = path;
        }
    }

    /// Trace file location; relative paths resolve next to the config file.
    pub fn resolve_trace_path(&self) -> PathBuf {
        let configured = PathBuf::from(self.trace.path.trim());
        if configured.is_absolute() {
            return configured;
        }
        match self.config_path.parent() {
            Some(dir) => dir.join(configured),
            None => configured,
        }
    }

    /// JSON schema of the config file.
    pub fn schema_json() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize config schema")
    }

    /// Write the config to `config_path`, replacing any existing file
    /// atomically.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(DEFAULT_CONFIG_FILE);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        }
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.protocol, ProtocolConfig::default());
        assert_eq!(config.trace, TraceConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn plugin_sections_parse() {
        let config: Config = toml::from_str(
            r#"
            [protocol]
            version = "v2"

            [plugins."db.rs"]
            command = "shared-worker"
            args = ["plugin", "echo"]
            "#,
        )
        .unwrap();
        let plugin = &config.plugins["db.rs"];
        assert_eq!(plugin.command, "shared-worker");
        assert_eq!(plugin.args, vec!["plugin", "echo"]);
    }

    #[test]
    fn validate_rejects_unknown_trace_mode() {
        let mut config = Config::default();
        config.trace.mode = "verbose".into();
        let error = config.validate().unwrap_err().to_string();
        assert!(error.contains("trace.mode"), "{error}");
    }

    #[test]
    fn validate_rejects_zero_rolling_entries() {
        let mut config = Config::default();
        config.trace.mode = "rolling".into();
        config.trace.max_entries = 0;
        assert!(config.validate().is_err());

        config.trace.mode = "full".into();
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_blank_protocol_and_command() {
        let mut config = Config::default();
        config.protocol.version = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.plugins.insert(
            "db.rs".into(),
            PluginProcessConfig {
                command: String::new(),
                args: vec![],
            },
        );
        let error = config.validate().unwrap_err().to_string();
        assert!(error.contains("db.rs"), "{error}");
    }

    #[test]
    fn env_overrides_replace_protocol_and_trace() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[
            ("SHARED_WORKER_PROTOCOL", " v3 "),
            ("SHARED_WORKER_TRACE_MODE", "Rolling"),
        ]));
        assert_eq!(config.protocol.version, "v3");
        assert_eq!(config.trace.mode, "rolling");
        assert_eq!(config.trace.path, default_trace_path());
    }

    #[test]
    fn blank_env_overrides_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[("SHARED_WORKER_PROTOCOL", "")]));
        assert_eq!(config.protocol.version, "v2");
    }

    #[test]
    fn relative_trace_path_resolves_next_to_config() {
        let mut config = Config::default();
        config.config_path = PathBuf::from("/etc/shared-worker/shared-worker.toml");
        assert_eq!(
            config.resolve_trace_path(),
            PathBuf::from("/etc/shared-worker/state/envelope-trace.jsonl")
        );

        config.trace.path = "/var/log/trace.jsonl".into();
        assert_eq!(
            config.resolve_trace_path(),
            PathBuf::from("/var/log/trace.jsonl")
        );
    }

    #[test]
    fn schema_names_every_section() {
        let schema = Config::schema_json().unwrap();
        for section in ["protocol", "trace", "plugins"] {
            assert!(schema.contains(section), "missing {section}");
        }
    }
}
