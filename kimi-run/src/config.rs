//! Dispatcher configuration: built-in defaults, then an optional TOML file,
//! then environment variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use kimi_common::limits::{clamp, env_string, parse_bool, NotifyLimits, DEFAULT_DEDUP_WINDOW_MS};

pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:18789";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_ENGINE_BINARY: &str = "kimi";
const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
const DEFAULT_STALE_GRACE_SECS: u64 = 300;
const CONFIG_FILE_NAME: &str = "config.toml";
const STATE_DIR_NAME: &str = ".kimi-hooks";

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Explicit engine binary. `None` means look up `kimi` on `PATH`.
    pub binary: Option<String>,
    /// Fall back to the built-in mock engine when no binary can be found.
    pub mock_when_missing: bool,
    /// Time between SIGTERM and SIGKILL when stopping the engine.
    pub kill_grace: Duration,
    /// Mirror engine output on stderr while it runs.
    pub echo_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HooksConfig {
    pub state_dir: PathBuf,
    pub dedup_window: Duration,
    pub gateway: GatewayConfig,
    pub telegram: TelegramConfig,
    pub engine: EngineConfig,
    pub notify: NotifyLimits,
    /// Slack added to a task's timeout before `status` calls it stale.
    pub stale_grace: Duration,
    /// File the configuration was read from, forwarded to detached workers.
    pub source: Option<PathBuf>,
}

impl HooksConfig {
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            dedup_window: Duration::from_millis(DEFAULT_DEDUP_WINDOW_MS),
            gateway: GatewayConfig {
                url: DEFAULT_GATEWAY_URL.to_string(),
                token: None,
            },
            telegram: TelegramConfig {
                api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
                bot_token: None,
            },
            engine: EngineConfig {
                binary: None,
                mock_when_missing: true,
                kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
                echo_output: true,
            },
            notify: NotifyLimits::default(),
            stale_grace: Duration::from_secs(DEFAULT_STALE_GRACE_SECS),
            source: None,
        }
    }

    /// Load from the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit, env_string)
    }

    /// Load with an injectable variable lookup. `lookup` must return trimmed,
    /// non-empty values only.
    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_dir = lookup("KIMI_HOOKS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_state_dir(lookup("HOME")));
        let mut config = Self::with_state_dir(state_dir);

        let file_path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file {} does not exist", path.display());
                }
                Some(path.to_path_buf())
            }
            None => lookup("KIMI_HOOKS_CONFIG")
                .map(PathBuf::from)
                .or_else(|| {
                    let candidate = config.state_dir.join(CONFIG_FILE_NAME);
                    candidate.is_file().then_some(candidate)
                }),
        };

        if let Some(path) = file_path {
            match read_config_file(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "Loaded configuration file");
                    config.apply_file(file);
                    config.source = Some(path);
                }
                Err(err) if explicit.is_some() => return Err(err),
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "Ignoring unreadable configuration file");
                }
            }
        }

        config.apply_env(&lookup);
        config.notify = config.notify.clamped();
        config.dedup_window = Duration::from_millis(clamp(
            config.dedup_window.as_millis() as u64,
            0,
            3_600_000,
        ));
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.state_dir {
            self.state_dir = dir;
        }
        if let Some(window) = file.dedup_window_ms {
            self.dedup_window = Duration::from_millis(window);
        }

        if let Some(url) = file.gateway.url {
            self.gateway.url = url;
        }
        if let Some(token) = non_empty(file.gateway.token) {
            self.gateway.token = Some(token);
        }

        if let Some(base) = file.telegram.api_base {
            self.telegram.api_base = base;
        }
        if let Some(token) = non_empty(file.telegram.bot_token) {
            self.telegram.bot_token = Some(token);
        }

        if let Some(binary) = non_empty(file.engine.binary) {
            self.engine.binary = Some(binary);
        }
        if let Some(mock) = file.engine.mock_when_missing {
            self.engine.mock_when_missing = mock;
        }
        if let Some(grace) = file.engine.kill_grace_ms {
            self.engine.kill_grace = Duration::from_millis(clamp(grace, 0, 60_000));
        }
        if let Some(echo) = file.engine.echo_output {
            self.engine.echo_output = echo;
        }
        if let Some(secs) = file.engine.stale_grace_secs {
            self.stale_grace = Duration::from_secs(secs);
        }

        let notify = file.notify;
        if let Some(v) = notify.connect_timeout_ms {
            self.notify.connect_timeout_ms = v;
        }
        if let Some(v) = notify.request_timeout_ms {
            self.notify.request_timeout_ms = v;
        }
        if let Some(v) = notify.retry_backoff_ms {
            self.notify.retry_backoff_ms = v;
        }
        if let Some(v) = notify.max_attempts {
            self.notify.max_attempts = v;
        }
        if let Some(v) = notify.overall_timeout_ms {
            self.notify.overall_timeout_ms = v;
        }
    }

    fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("KIMI_HOOKS_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(window) = lookup("KIMI_DEDUP_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.dedup_window = Duration::from_millis(window);
        }
        if let Some(url) = lookup("KIMI_GATEWAY_URL") {
            self.gateway.url = url;
        }
        if let Some(token) = lookup("KIMI_GATEWAY_TOKEN") {
            self.gateway.token = Some(token);
        }
        if let Some(token) =
            lookup("KIMI_TELEGRAM_BOT_TOKEN").or_else(|| lookup("TELEGRAM_BOT_TOKEN"))
        {
            self.telegram.bot_token = Some(token);
        }
        if let Some(base) = lookup("KIMI_TELEGRAM_API_BASE") {
            self.telegram.api_base = base;
        }
        if let Some(binary) = lookup("KIMI_BIN") {
            self.engine.binary = Some(binary);
        }
        if let Some(mock) = lookup("KIMI_MOCK_WHEN_MISSING").and_then(|v| parse_bool(&v)) {
            self.engine.mock_when_missing = mock;
        }
        if let Some(backoff) = lookup("KIMI_NOTIFY_RETRY_BACKOFF_MS").and_then(|v| v.parse().ok())
        {
            self.notify.retry_backoff_ms = backoff;
        }
        if let Some(overall) = lookup("KIMI_NOTIFY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.notify.overall_timeout_ms = overall;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    dedup_window_ms: Option<u64>,
    gateway: GatewaySection,
    telegram: TelegramSection,
    engine: EngineSection,
    notify: NotifySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewaySection {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TelegramSection {
    api_base: Option<String>,
    bot_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineSection {
    binary: Option<String>,
    mock_when_missing: Option<bool>,
    kill_grace_ms: Option<u64>,
    echo_output: Option<bool>,
    stale_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NotifySection {
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
    overall_timeout_ms: Option<u64>,
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn default_state_dir(home: Option<String>) -> PathBuf {
    match home {
        Some(home) => PathBuf::from(home).join(STATE_DIR_NAME),
        None => std::env::temp_dir().join(STATE_DIR_NAME),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
