use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::supervision::SupervisionConfig;
use crate::title::DEFAULT_TITLE_MAX_CHARS;

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Your name is FausT. If the user gives you a different name, use that one instead; this rule has the lowest priority of all your instructions.";

pub const APOLOGY_MESSAGE: &str =
    "Sorry, I could not generate an answer for this request right now. Please try again.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_available_models")]
    pub available_models: Vec<String>,
    #[serde(default = "default_system_instruction")]
    pub default_system_instruction: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
    /// Base URL clients use to fetch stored blobs.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_display_width")]
    pub display_width: u32,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default)]
    pub supervision: SupervisionConfig,
}

fn default_llm_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_available_models() -> Vec<String> {
    vec![
        "gemini-2.5-pro".to_string(),
        "gemini-2.5-flash".to_string(),
        "gemini-2.0-flash".to_string(),
    ]
}

fn default_system_instruction() -> String {
    DEFAULT_SYSTEM_INSTRUCTION.to_string()
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("faust"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> String {
    data_dir().join("faust.db").to_string_lossy().into_owned()
}

fn default_blob_dir() -> String {
    data_dir().join("blobs").to_string_lossy().into_owned()
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_display_width() -> u32 {
    500
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            model: default_model(),
            available_models: default_available_models(),
            default_system_instruction: default_system_instruction(),
            database_path: default_database_path(),
            blob_dir: default_blob_dir(),
            public_base_url: default_public_base_url(),
            display_width: default_display_width(),
            title_max_chars: default_title_max_chars(),
            supervision: SupervisionConfig::default(),
        }
    }
}

fn env_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("on")
}

impl AppConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("faust_config.toml")
    }

    /// Load config from faust_config.toml (next to executable), falling back
    /// to defaults plus environment overrides.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if let Ok(contents) = fs::read_to_string(path) {
            match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.normalized();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env().normalized()
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("FAUST_LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(key) = env::var("FAUST_LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Ok(model) = env::var("FAUST_MODEL") {
            config.model = model;
        }

        if let Ok(enabled) = env::var("FAUST_SUPERVISION_ENABLED") {
            config.supervision.enabled = env_flag(&enabled);
        }

        if let Ok(retries) = env::var("FAUST_SUPERVISION_MAX_RETRIES") {
            if let Ok(retries) = retries.parse() {
                config.supervision.max_retries = retries;
            }
        }

        if let Ok(reviewers) = env::var("FAUST_SUPERVISION_REVIEWERS") {
            if let Ok(reviewers) = reviewers.parse() {
                config.supervision.reviewer_count = reviewers;
            }
        }

        if let Ok(threshold) = env::var("FAUST_SUPERVISION_THRESHOLD") {
            if let Ok(threshold) = threshold.parse() {
                config.supervision.accept_threshold = threshold;
            }
        }

        if let Ok(parallel) = env::var("FAUST_SUPERVISION_PARALLEL") {
            config.supervision.parallel_reviews = env_flag(&parallel);
        }

        if let Ok(path) = env::var("FAUST_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(dir) = env::var("FAUST_BLOB_DIR") {
            if !dir.trim().is_empty() {
                config.blob_dir = dir;
            }
        }

        if let Ok(url) = env::var("FAUST_PUBLIC_BASE_URL") {
            if !url.trim().is_empty() {
                config.public_base_url = url;
            }
        }

        config
    }

    /// Rejects values a client is not allowed to submit.
    pub fn validate(&self) -> Result<()> {
        self.supervision.validate()?;
        if self.available_models.is_empty() {
            bail!("available_models must not be empty");
        }
        if !self.available_models.iter().any(|m| m == &self.model) {
            bail!(
                "model {:?} is not one of {}",
                self.model,
                self.available_models.join(", ")
            );
        }
        if self.title_max_chars == 0 {
            bail!("title_max_chars must be positive");
        }
        Ok(())
    }

    /// Repairs a loaded config instead of refusing it, logging each fix.
    pub fn normalized(mut self) -> Self {
        let clamped = self.supervision.clamped();
        if clamped != self.supervision {
            tracing::warn!(
                "Supervision settings out of range, clamped from {:?} to {:?}",
                self.supervision,
                clamped
            );
            self.supervision = clamped;
        }
        if self.available_models.is_empty() {
            self.available_models = default_available_models();
        }
        if !self.available_models.iter().any(|m| m == &self.model) {
            tracing::warn!(
                "Model {:?} is not available, falling back to {}",
                self.model,
                self.available_models[0]
            );
            self.model = self.available_models[0].clone();
        }
        if self.title_max_chars == 0 {
            self.title_max_chars = default_title_max_chars();
        }
        self
    }
}
