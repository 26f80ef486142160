//! agentbridge configuration loader.
//!
//! TOML file, then `.env`/environment overrides, then validation.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Model used for translation and source matching.
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_true")]
    pub require_plan_approval: bool,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
            api_key: String::new(),
            default_branch: default_branch(),
            require_plan_approval: true,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

fn default_agent_base_url() -> String {
    "https://jules.googleapis.com/v1alpha".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Wall-clock budget of one monitoring run.
    #[serde(default = "default_monitor_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Silence after which a "still working" message is posted.
    #[serde(default = "default_idle_threshold_seconds")]
    pub idle_threshold_seconds: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            timeout_seconds: default_monitor_timeout_seconds(),
            idle_threshold_seconds: default_idle_threshold_seconds(),
        }
    }
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_monitor_timeout_seconds() -> u64 {
    600
}

fn default_idle_threshold_seconds() -> u64 {
    60
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_user_language")]
    pub user_language: String,
    #[serde(default = "default_agent_language")]
    pub agent_language: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_language: default_user_language(),
            agent_language: default_agent_language(),
        }
    }
}

fn default_user_language() -> String {
    "Japanese".to_string()
}

fn default_agent_language() -> String {
    "English".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScalingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub access_token: String,
    /// Warm instances kept while any monitor is running.
    #[serde(default = "default_active_min_instances")]
    pub active_min_instances: u32,
    #[serde(default)]
    pub idle_min_instances: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project: String::new(),
            region: String::new(),
            service: String::new(),
            access_token: String::new(),
            active_min_instances: default_active_min_instances(),
            idle_min_instances: 0,
        }
    }
}

fn default_active_min_instances() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

fn default_server_port() -> u16 {
    8080
}

impl AppConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_value("AGENTBRIDGE_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = env_value("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = env_value("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = env_value("AGENT_API_KEY") {
            self.agent.api_key = v;
        }
        if let Some(v) = env_value("AGENT_BASE_URL") {
            self.agent.base_url = v;
        }
        if let Some(v) = env_value("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = env_value("SCALING_ACCESS_TOKEN") {
            self.scaling.access_token = v;
        }
        if let Some(port) = env_value("PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "agent.api_key is required (or set AGENT_API_KEY)"
            ));
        }
        if self.agent.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("agent.request_timeout_seconds must be > 0"));
        }
        if self.monitor.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("monitor.poll_interval_seconds must be > 0"));
        }
        if self.monitor.poll_interval_seconds >= self.monitor.timeout_seconds {
            return Err(anyhow::anyhow!(
                "monitor.poll_interval_seconds must be below monitor.timeout_seconds"
            ));
        }
        if self.monitor.idle_threshold_seconds == 0
            || self.monitor.idle_threshold_seconds >= self.monitor.timeout_seconds
        {
            return Err(anyhow::anyhow!(
                "monitor.idle_threshold_seconds must be > 0 and below monitor.timeout_seconds"
            ));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        if self.scaling.enabled {
            for (field, value) in [
                ("scaling.project", &self.scaling.project),
                ("scaling.region", &self.scaling.region),
                ("scaling.service", &self.scaling.service),
                ("scaling.access_token", &self.scaling.access_token),
            ] {
                if value.trim().is_empty() {
                    return Err(anyhow::anyhow!("{field} is required when scaling is enabled"));
                }
            }
        }
        Ok(())
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.general.model.to_ascii_lowercase();
        if model.starts_with("claude-") {
            return self
                .keys
                .anthropic_api_key
                .clone()
                .filter(|s| !s.is_empty());
        }
        self.keys.openai_api_key.clone().filter(|s| !s.is_empty())
    }

    pub fn agent_request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.request_timeout_seconds)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".agentbridge").join("config.toml")
}
