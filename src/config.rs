use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Command-line flags. Secrets fall back to the environment when the flag is absent.
#[derive(Debug, Parser)]
#[command(name = "gemini-relay")]
#[command(about = "Relay Telegram messages and photos to Gemini and reply with the answer")]
#[command(version)]
pub struct Cli {
    /// Telegram bot token.
    #[arg(long = "telegram-bot-token", env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    /// Gemini API key.
    #[arg(long = "google-gemini-key", env = "GOOGLE_GEMINI_KEY", hide_env_values = true)]
    pub google_gemini_key: Option<String>,

    /// Optional TOML file with model and relay settings.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// The two secrets the process cannot start without.
#[derive(Clone)]
pub struct Credentials {
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("telegram_bot_token", &"<redacted>")
            .field("gemini_api_key", &"<redacted>")
            .finish()
    }
}

impl Cli {
    /// Resolve both secrets; blank values count as missing.
    pub fn credentials(&self) -> Result<Credentials> {
        let telegram_bot_token = non_blank(self.telegram_bot_token.as_deref())
            .context("Telegram Bot Token must be set (--telegram-bot-token or TELEGRAM_BOT_TOKEN)")?;
        let gemini_api_key = non_blank(self.google_gemini_key.as_deref())
            .context("API Key must be set (--google-gemini-key or GOOGLE_GEMINI_KEY)")?;

        Ok(Credentials {
            telegram_bot_token,
            gemini_api_key,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Text part sent alongside a photo when the caption carries no question.
    #[serde(default = "default_image_prompt")]
    pub default_image_prompt: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            text_model: default_text_model(),
            vision_model: default_vision_model(),
            default_image_prompt: default_image_prompt(),
        }
    }
}

impl GeminiConfig {
    /// Returns the effective base_url: if the stored value is empty,
    /// fall back to the public v1beta endpoint.
    pub fn effective_base_url(&self) -> &str {
        if self.base_url.is_empty() {
            DEFAULT_GEMINI_BASE_URL
        } else {
            self.base_url.trim_end_matches('/')
        }
    }

    pub fn effective_text_model(&self) -> &str {
        if self.text_model.trim().is_empty() {
            DEFAULT_TEXT_MODEL
        } else {
            self.text_model.trim()
        }
    }

    pub fn effective_vision_model(&self) -> &str {
        if self.vision_model.trim().is_empty() {
            DEFAULT_VISION_MODEL
        } else {
            self.vision_model.trim()
        }
    }

    pub fn effective_default_image_prompt(&self) -> &str {
        if self.default_image_prompt.trim().is_empty() {
            DEFAULT_IMAGE_PROMPT
        } else {
            &self.default_image_prompt
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Command token recognised in group chats.
    #[serde(default = "default_command")]
    pub command: String,
    /// Upper bound on generations in flight; 0 means unbounded.
    #[serde(default)]
    pub max_concurrent_requests: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            max_concurrent_requests: 0,
        }
    }
}

impl RelayConfig {
    pub fn effective_command(&self) -> &str {
        if self.command.trim().is_empty() {
            DEFAULT_COMMAND
        } else {
            self.command.trim()
        }
    }
}

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TEXT_MODEL: &str = "gemini-pro";
const DEFAULT_VISION_MODEL: &str = "gemini-pro-vision";
const DEFAULT_IMAGE_PROMPT: &str = "描述这张图片";
const DEFAULT_COMMAND: &str = "/gemini";

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

fn default_vision_model() -> String {
    DEFAULT_VISION_MODEL.to_string()
}

fn default_image_prompt() -> String {
    DEFAULT_IMAGE_PROMPT.to_string()
}

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}

impl Config {
    /// Load settings from `path`, or use built-in defaults when no file was given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
