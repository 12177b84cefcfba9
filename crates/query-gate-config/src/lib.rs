#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use query_gate_domain::{ensure_non_empty, GateError};
use serde::{Deserialize, Serialize};

pub const ENV_AI_CHAT_ENABLED: &str = "QUERY_GATE_AI_CHAT_ENABLED";
pub const ENV_AGENT_BACKEND: &str = "QUERY_GATE_AGENT_BACKEND";
pub const ENV_AI_MODEL: &str = "QUERY_GATE_AI_MODEL";
pub const ENV_SECURITY_LISTENER: &str = "QUERY_GATE_SECURITY_LISTENER";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentBackendKind {
    #[default]
    HttpJson,
    Mock,
}

impl AgentBackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpJson => "http_json",
            Self::Mock => "mock",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http_json" => Some(Self::HttpJson),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub chat: ChatSettings,
    pub security: SecuritySettings,
    pub database: DatabaseSettings,
    pub chat_store: ChatStoreSettings,
    pub http_agent: HttpAgentSettings,
    pub mock_agent: MockAgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChatSettings {
    pub ai_chat_enabled: bool,
    /// Vendor name recorded in message metadata.
    pub ai_provider: String,
    pub ai_model: String,
    pub agent_backend: AgentBackendKind,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            ai_chat_enabled: false,
            ai_provider: "openai".to_string(),
            ai_model: "gpt-4".to_string(),
            agent_backend: AgentBackendKind::HttpJson,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySettings {
    pub enable_ai_security_listener: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            enable_ai_security_listener: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./query_gate.sqlite3"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChatStoreSettings {
    pub path: PathBuf,
}

impl Default for ChatStoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./query_gate_chat.sqlite3"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpAgentSettings {
    pub url: String,
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    /// Rows forwarded back to the model per tool result.
    pub max_result_rows: usize,
}

impl Default for HttpAgentSettings {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_ms: 30_000,
            max_result_rows: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MockRule {
    pub contains: String,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MockAgentSettings {
    pub rules: Vec<MockRule>,
    pub fallback_sql: String,
}

impl Default for MockAgentSettings {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            fallback_sql: "SELECT COUNT(*) AS total FROM tasks".to_string(),
        }
    }
}

/// Load settings YAML from disk, apply process environment overrides and validate.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, an override is
/// malformed, or validation fails.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let mut settings = parse_settings_yaml(&content)?;
    settings.apply_env_overrides(|key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

/// Parse settings YAML. Missing sections and fields take their defaults.
///
/// # Errors
/// Returns an error when the YAML is malformed or names unknown fields.
pub fn parse_settings_yaml(yaml: &str) -> Result<Settings> {
    if yaml.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid settings YAML structure: {err}"))
}

impl Settings {
    /// Apply `QUERY_GATE_*` overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns an error when an override value cannot be parsed.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_AI_CHAT_ENABLED) {
            self.chat.ai_chat_enabled = parse_flag(ENV_AI_CHAT_ENABLED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_AGENT_BACKEND) {
            self.chat.agent_backend = AgentBackendKind::parse(&raw).ok_or_else(|| {
                GateError::Configuration(format!(
                    "{ENV_AGENT_BACKEND} must be 'http_json' or 'mock', got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = lookup(ENV_AI_MODEL) {
            self.chat.ai_model = raw;
        }
        if let Some(raw) = lookup(ENV_SECURITY_LISTENER) {
            self.security.enable_ai_security_listener = parse_flag(ENV_SECURITY_LISTENER, &raw)?;
        }
        Ok(())
    }

    /// Validate cross-field requirements.
    ///
    /// # Errors
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("chat.ai_provider", &self.chat.ai_provider)?;
        ensure_non_empty("chat.ai_model", &self.chat.ai_model)?;
        ensure_non_empty("database.path", &self.database.path.to_string_lossy())?;
        ensure_non_empty("chat_store.path", &self.chat_store.path.to_string_lossy())?;
        ensure_non_empty("http_agent.url", &self.http_agent.url)?;
        ensure_non_empty("mock_agent.fallback_sql", &self.mock_agent.fallback_sql)?;

        if self.http_agent.timeout_ms == 0 {
            return Err(invalid("http_agent.timeout_ms MUST be positive"));
        }
        if self.http_agent.max_result_rows == 0 {
            return Err(invalid("http_agent.max_result_rows MUST be positive"));
        }
        for (index, rule) in self.mock_agent.rules.iter().enumerate() {
            ensure_non_empty(&format!("mock_agent.rules[{index}].contains"), &rule.contains)?;
            ensure_non_empty(&format!("mock_agent.rules[{index}].sql"), &rule.sql)?;
        }
        Ok(())
    }
}

fn invalid(message: &str) -> anyhow::Error {
    GateError::Validation(message.to_string()).into()
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GateError::Configuration(format!(
            "{name} must be a boolean flag, got '{raw}'"
        ))
        .into()),
    }
}
