use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub chat: Option<ChatConfig>,
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: Option<bool>,
    pub schedule_cycle_ms: Option<u64>,
    pub delete_after_completion: Option<bool>,
    pub requeue_stale_on_start: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub idle_timeout_secs: Option<u64>,
    pub instruction_key: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI compatible endpoint, e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Shell command printing the API key. Wins over `api_key`.
    pub api_key_command: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub temperature: Option<f32>,
    /// System prompts by instruction key.
    pub instructions: HashMap<String, String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
