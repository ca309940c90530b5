mod file_config;

pub use file_config::{ChatConfig, FileConfig, LlmConfig, SchedulerConfig};

use crate::chat::ChatSettings;
use crate::conversation::{ApiKeySource, OpenAIEngineSettings};
use crate::future_jobs::SchedulerSettings;
use crate::server::{RequestsLoggingLevel, ServerConfig};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_REQUEST_TIMEOUT_SECS: u64 = 60;

/// System prompt of the default instruction key, used when the config has none.
const DEFAULT_CHAT_INSTRUCTION: &str = "You are a supportive companion in a private chat. \
Reply with a JSON object {\"type\": \"text\", \"data\": \"<your reply>\"}. \
If the user may be in danger, reply {\"type\": \"action\", \"data\": \"escalate_crisis\"}. \
When a short questionnaire would help, reply with the action suggest_test_phq9, \
suggest_test_gad7 or suggest_test_pss. \
When the user wants to stop, reply with the action end_conversation.";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,

    // Feature configs (with defaults)
    pub scheduler: SchedulerSettings,
    pub chat: ChatSettings,
    pub llm: OpenAIEngineSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let scheduler = resolve_scheduler(file.scheduler.unwrap_or_default());
        let chat = resolve_chat(file.chat.unwrap_or_default())?;
        let llm = resolve_llm(file.llm.unwrap_or_default(), &chat.instruction_key)?;

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            logging_level,
            scheduler,
            chat,
            llm,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            requests_logging_level: self.logging_level.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
        }
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }

    pub fn chat_db_path(&self) -> PathBuf {
        self.db_dir.join("chat.db")
    }

    pub fn user_db_path(&self) -> PathBuf {
        self.db_dir.join("user.db")
    }
}

fn resolve_scheduler(file: SchedulerConfig) -> SchedulerSettings {
    let defaults = SchedulerSettings::default();
    SchedulerSettings {
        enabled: file.enabled.unwrap_or(defaults.enabled),
        schedule_cycle: file
            .schedule_cycle_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.schedule_cycle),
        delete_after_completion: file
            .delete_after_completion
            .unwrap_or(defaults.delete_after_completion),
        requeue_stale_on_start: file
            .requeue_stale_on_start
            .unwrap_or(defaults.requeue_stale_on_start),
    }
}

fn resolve_chat(file: ChatConfig) -> Result<ChatSettings> {
    let defaults = ChatSettings::default();
    let idle_timeout = match file.idle_timeout_secs {
        Some(0) => bail!("chat.idle_timeout_secs must be greater than zero"),
        Some(secs) => Duration::from_secs(secs),
        None => defaults.idle_timeout,
    };
    Ok(ChatSettings {
        idle_timeout,
        instruction_key: file.instruction_key.unwrap_or(defaults.instruction_key),
    })
}

fn resolve_llm(file: LlmConfig, instruction_key: &str) -> Result<OpenAIEngineSettings> {
    let api_key = match (file.api_key_command, file.api_key) {
        (Some(command), _) if !command.trim().is_empty() => ApiKeySource::Command(command),
        (_, Some(key)) if !key.trim().is_empty() => ApiKeySource::Static(key),
        _ => ApiKeySource::None,
    };

    if let Some(temperature) = file.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            bail!("llm.temperature must be between 0 and 2, got {}", temperature);
        }
    }

    let mut instructions: HashMap<String, String> = file.instructions;
    instructions
        .entry(instruction_key.to_string())
        .or_insert_with(|| DEFAULT_CHAT_INSTRUCTION.to_string());

    Ok(OpenAIEngineSettings {
        base_url: file
            .base_url
            .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
        model: file.model.unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        api_key,
        temperature: file.temperature,
        request_timeout: Duration::from_secs(
            file.request_timeout_secs
                .unwrap_or(DEFAULT_LLM_REQUEST_TIMEOUT_SECS),
        ),
        json_mode: true,
        instructions,
    })
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
