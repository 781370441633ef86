//! Configuration file support for ramify
//!
//! Reads from .ramify/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::layout::LayoutConfig;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Send behavior
    #[serde(default)]
    pub engine: EngineConfig,

    /// Tree layout constants
    #[serde(default)]
    pub layout: LayoutConfig,
}

/// What to do when a response was generated but could not be saved
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistFailurePolicy {
    /// Keep the response on screen, mark the node unsynced, retry later
    #[default]
    KeepUnsynced,
    /// Undo the local change as if generation had failed
    Rollback,
}

/// Engine-related configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Model name passed to the completion service
    /// Default: "gemini-2.5-flash"
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Move focus onto a new branch after sending into it
    /// Default: false
    #[serde(default)]
    pub focus_follow: bool,

    #[serde(default)]
    pub persist_failure: PersistFailurePolicy,

    /// Title given to a conversation when its first message is saved
    #[serde(default = "default_new_conversation_title")]
    pub new_conversation_title: String,

    /// Title used when the summarizer produces nothing usable
    #[serde(default = "default_title_fallback")]
    pub title_fallback: String,
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_new_conversation_title() -> String {
    "New Discussion".to_string()
}

fn default_title_fallback() -> String {
    "New Conversation".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            focus_follow: false,
            persist_failure: PersistFailurePolicy::default(),
            new_conversation_title: default_new_conversation_title(),
            title_fallback: default_title_fallback(),
        }
    }
}

impl Config {
    /// Load config from .ramify/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        let Some(path) = Self::find_config_path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                Self::default()
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".ramify").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }
}
