use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
pub const ENV_BIND_ADDRESS: &str = "BIND_ADDRESS";
pub const ENV_CERTIFICATE: &str = "HTTPS_CERTIFICATE";
pub const ENV_PRIVATE_KEY: &str = "HTTPS_KEY";
pub const ENV_WEBHOOK_URL: &str = "WEBHOOK_URL";
pub const ENV_API_BASE: &str = "TELEGRAM_API_BASE";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Public HTTPS base the platform posts to; the bot token is appended as
    /// the last path segment.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_reply_text")]
    pub reply_text: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_certificate")]
    pub certificate: PathBuf,
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpClientConfig {
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_public_url() -> String {
    "https://localhost:88".to_string()
}

fn default_reply_text() -> String {
    "Усек!".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:7001".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_certificate() -> PathBuf {
    PathBuf::from("fullchain.pem")
}

fn default_private_key() -> PathBuf {
    PathBuf::from("privatekey.pem")
}

fn default_max_idle_per_host() -> usize {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            reply_text: default_reply_text(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificate: default_certificate(),
            private_key: default_private_key(),
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bind address with an empty host (":7001") expanded to all interfaces.
    pub fn bind_target(&self) -> String {
        if self.bind_address.starts_with(':') {
            format!("0.0.0.0{}", self.bind_address)
        } else {
            self.bind_address.clone()
        }
    }
}

impl HttpClientConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolve configuration the way the binary does: an explicit path must
    /// exist, `config.toml` is used when present, built-in defaults otherwise.
    /// Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let fallback = Path::new("config.toml");
                if fallback.exists() {
                    Self::load(fallback)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from the environment. `lookup` abstracts
    /// `std::env::var` so overrides can be exercised without touching the
    /// process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BOT_TOKEN) {
            self.telegram.bot_token = value;
        }
        if let Some(value) = lookup(ENV_API_BASE) {
            self.telegram.api_base = value;
        }
        if let Some(value) = lookup(ENV_BIND_ADDRESS) {
            self.server.bind_address = value;
        }
        if let Some(value) = lookup(ENV_CERTIFICATE) {
            self.tls.certificate = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_PRIVATE_KEY) {
            self.tls.private_key = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_WEBHOOK_URL) {
            self.webhook.public_url = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "Bot token is not configured (set [telegram] bot_token or {})",
                ENV_BOT_TOKEN
            );
        }
        if !self.webhook.public_url.starts_with("https://") {
            anyhow::bail!(
                "Webhook public_url must be an https:// URL, got {}",
                self.webhook.public_url
            );
        }
        Ok(())
    }
}

/// Mask a secret for safe logging: first 7 + "***" + last 4 characters;
/// anything 11 characters or shorter becomes "***".
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 11 {
        return "***".to_string();
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}
