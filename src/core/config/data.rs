use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::constants::{DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::core::conversation::SamplingSettings;

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Base URL of an OpenAI-compatible API (e.g., "https://api.openai.com/v1")
    pub base_url: Option<String>,
    /// Model requested for every completion
    pub model: Option<String>,
    /// Free-form background about the user, appended to every system prompt
    pub user_context: Option<String>,
    /// HTTP timeout for a single completion request
    pub request_timeout_secs: Option<u64>,
}

/// Keys accepted by `coachai set` / `coachai unset`.
pub const CONFIG_KEYS: [&str; 4] = ["base-url", "model", "user-context", "request-timeout"];

impl Config {
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn sampling(&self) -> SamplingSettings {
        SamplingSettings {
            model: self
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ..SamplingSettings::default()
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("A value is required for {key}"));
        }
        match key {
            "base-url" => self.base_url = Some(value.to_string()),
            "model" => self.model = Some(value.to_string()),
            "user-context" => self.user_context = Some(value.to_string()),
            "request-timeout" => {
                let secs = value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| format!("Invalid timeout '{value}': expected whole seconds"))?;
                self.request_timeout_secs = Some(secs);
            }
            other => return Err(unknown_key(other)),
        }
        Ok(())
    }

    pub fn unset_value(&mut self, key: &str) -> Result<(), String> {
        match key {
            "base-url" => self.base_url = None,
            "model" => self.model = None,
            "user-context" => self.user_context = None,
            "request-timeout" => self.request_timeout_secs = None,
            other => return Err(unknown_key(other)),
        }
        Ok(())
    }

    pub fn print_all(&self) {
        println!("Current configuration:");
        println!("  base-url: {}", self.base_url());
        println!("  model: {}", self.model.as_deref().unwrap_or(DEFAULT_MODEL));
        match &self.user_context {
            Some(ctx) => println!("  user-context: {ctx}"),
            None => println!("  user-context: (unset)"),
        }
        println!("  request-timeout: {}s", self.request_timeout().as_secs());
    }
}

fn unknown_key(key: &str) -> String {
    format!(
        "Unknown config key '{key}'. Available keys: {}",
        CONFIG_KEYS.join(", ")
    )
}

pub(crate) fn path_display(path: &Path) -> String {
    path.display().to_string()
}
