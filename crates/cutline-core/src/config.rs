//! Client configuration.
//!
//! Loads ${CUTLINE_HOME}/config.toml with sensible defaults. Everything is
//! optional; a missing file yields a config pointing at a local server.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tool-card presentation tuning: expected durations for the synthetic
/// progress estimator, its tick rate, activation delay and running cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolUiConfig {
    /// Expected duration per tool, keyed by "server.name" or bare name.
    pub estimates_ms: BTreeMap<String, u64>,
    /// Fallback expected duration for unknown tools.
    pub default_estimate_ms: u64,
    /// Recompute interval for the synthetic estimator.
    pub tick_ms: u64,
    /// Grace period before the estimator activates, so calls that finish
    /// almost immediately never flash a progress bar.
    pub activation_delay_ms: u64,
    /// Upper bound for synthetic progress while a call is running.
    /// Strictly below 1 so an overdue call visibly stalls instead of
    /// pretending to finish.
    pub cap_running_progress: f64,
}

impl Default for ToolUiConfig {
    fn default() -> Self {
        Self {
            estimates_ms: BTreeMap::new(),
            default_estimate_ms: 8000,
            tick_ms: 120,
            activation_delay_ms: 2000,
            cap_running_progress: 0.99,
        }
    }
}

impl ToolUiConfig {
    /// Looks up the expected duration for a tool: full "server.name" key
    /// first, then the bare name, then the default.
    pub fn estimate_for(&self, server: &str, name: &str) -> Duration {
        let full = if server.is_empty() {
            name.to_string()
        } else {
            format!("{server}.{name}")
        };
        let ms = self
            .estimates_ms
            .get(&full)
            .or_else(|| self.estimates_ms.get(name))
            .copied()
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_estimate_ms);
        Duration::from_millis(ms)
    }

    /// Cap clamped into (0, 1); bad config values fall back to 0.99.
    pub fn effective_cap(&self) -> f64 {
        if self.cap_running_progress > 0.0 && self.cap_running_progress < 1.0 {
            self.cap_running_progress
        } else {
            0.99
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP(S) root of the service, e.g. `http://127.0.0.1:8000`.
    pub base_url: String,

    /// WebSocket root override. Defaults to `base_url` with the scheme
    /// switched to ws/wss; only needed when the channel is served from a
    /// different host than the API.
    pub ws_base_url: Option<String>,

    /// UI language sent with every message ("en", "zh", ...).
    pub lang: String,

    /// Delay before reconnecting after an unexpected closure.
    pub reconnect_delay_ms: u64,

    /// Keepalive ping interval on the persistent channel.
    pub heartbeat_interval_secs: u64,

    /// Minimum interval between streamed-text renders.
    pub render_interval_ms: u64,

    /// Chunk size suggested to the upload init endpoint. The server may
    /// override it; `None` lets the server pick entirely.
    pub upload_chunk_bytes: Option<u64>,

    /// Tool-card presentation tuning.
    #[serde(default)]
    pub tool_ui: ToolUiConfig,
}

impl Config {
    const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
    const DEFAULT_LANG: &str = "en";
    const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
    const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;
    const DEFAULT_RENDER_INTERVAL_MS: u64 = 80;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms.max(1))
    }

    /// WebSocket endpoint for a session's chat channel, derived from
    /// `base_url` (http → ws, https → wss) unless `ws_base_url` overrides.
    pub fn ws_url(&self, session_id: &str) -> String {
        let ws_base = match &self.ws_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => {
                let base = self.base_url.trim_end_matches('/');
                if let Some(rest) = base.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = base.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    format!("ws://{base}")
                }
            }
        };
        format!("{ws_base}/ws/sessions/{session_id}/chat")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            ws_base_url: None,
            lang: Self::DEFAULT_LANG.to_string(),
            reconnect_delay_ms: Self::DEFAULT_RECONNECT_DELAY_MS,
            heartbeat_interval_secs: Self::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            render_interval_ms: Self::DEFAULT_RENDER_INTERVAL_MS,
            upload_chunk_bytes: None,
            tool_ui: ToolUiConfig::default(),
        }
    }
}

pub mod paths {
    //! Path resolution for Cutline configuration and data.
    //!
    //! CUTLINE_HOME resolution order:
    //! 1. CUTLINE_HOME environment variable (if set)
    //! 2. ~/.config/cutline (default)

    use std::path::PathBuf;

    /// Returns the Cutline home directory.
    pub fn cutline_home() -> PathBuf {
        if let Ok(home) = std::env::var("CUTLINE_HOME") {
            return PathBuf::from(home);
        }

        std::env::home_dir()
            .map(|h| h.join(".config").join("cutline"))
            .expect("Could not determine home directory")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        cutline_home().join("config.toml")
    }

    /// Where the last used session id is persisted between runs.
    pub fn session_ref_path() -> PathBuf {
        cutline_home().join("session")
    }

    /// Directory for log files written by the CLI.
    pub fn logs_dir() -> PathBuf {
        cutline_home().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behavior() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.render_interval(), Duration::from_millis(80));
        assert_eq!(config.tool_ui.default_estimate_ms, 8000);
        assert_eq!(config.tool_ui.activation_delay_ms, 2000);
        assert!((config.tool_ui.effective_cap() - 0.99).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            base_url = "https://edit.example.com"

            [tool_ui]
            default_estimate_ms = 12000
            "#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://edit.example.com");
        assert_eq!(config.lang, "en");
        assert_eq!(config.tool_ui.default_estimate_ms, 12000);
        assert_eq!(config.tool_ui.tick_ms, 120);
    }

    #[test]
    fn ws_url_maps_scheme() {
        let config = Config {
            base_url: "https://edit.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.ws_url("s1"),
            "wss://edit.example.com/ws/sessions/s1/chat"
        );

        let config = Config {
            base_url: "http://localhost:8000".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.ws_url("abc"),
            "ws://localhost:8000/ws/sessions/abc/chat"
        );

        let config = Config {
            ws_base_url: Some("ws://channel.example.com".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.ws_url("s1"),
            "ws://channel.example.com/ws/sessions/s1/chat"
        );
    }

    #[test]
    fn load_from_reads_a_file_and_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:8000");

        std::fs::write(&path, "base_url = \"http://10.0.0.2:9000\"\nlang = \"zh\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url, "http://10.0.0.2:9000");
        assert_eq!(config.lang, "zh");
    }

    #[test]
    fn estimate_lookup_prefers_full_key() {
        let mut tool_ui = ToolUiConfig::default();
        tool_ui.estimates_ms.insert("media.render_video".to_string(), 30000);
        tool_ui.estimates_ms.insert("render_video".to_string(), 15000);

        assert_eq!(
            tool_ui.estimate_for("media", "render_video"),
            Duration::from_millis(30000)
        );
        assert_eq!(
            tool_ui.estimate_for("other", "render_video"),
            Duration::from_millis(15000)
        );
        assert_eq!(
            tool_ui.estimate_for("other", "unknown_tool"),
            Duration::from_millis(8000)
        );
    }
}
