//! Configuration for the background hub.
//!
//! Stored as JSON; every field has a default so a partial file (or no file
//! at all) yields a working configuration.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    /// Background hub settings.
    pub hub: HubConfig,
}

/// Background hub settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Popup window settings.
    pub popup: PopupConfig,
    /// Inject the page script when a content script sends `Init`.
    pub inject_on_init: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            popup: PopupConfig::default(),
            inject_on_init: true,
        }
    }
}

/// Popup window settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopupConfig {
    /// Extension page loaded in the popup.
    pub url: String,
    /// Popup width in pixels.
    pub width: u32,
    /// Popup height in pixels.
    pub height: u32,
    /// Gap between the popup and the focused window's top-right corner.
    pub margin: i32,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            url: "popup.html".to_string(),
            width: 400,
            height: 600,
            margin: 0,
        }
    }
}

/// Severity of a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    /// Works, but probably not what was meant.
    Warning,
    /// Cannot work.
    Error,
}

/// A problem found by [`ConduitConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Severity.
    pub level: IssueLevel,
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// Human-readable description.
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            field,
            message: message.into(),
        }
    }

    fn warning(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            field,
            message: message.into(),
        }
    }
}

impl ConduitConfig {
    /// Check the configuration for problems.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let popup = &self.hub.popup;

        if popup.url.trim().is_empty() {
            issues.push(ConfigIssue::error("hub.popup.url", "must not be empty"));
        }
        if popup.width == 0 || popup.height == 0 {
            issues.push(ConfigIssue::error(
                "hub.popup",
                "width and height must be positive",
            ));
        }
        if popup.width > 4096 || popup.height > 4096 {
            issues.push(ConfigIssue::warning(
                "hub.popup",
                format!("{}x{} is larger than most screens", popup.width, popup.height),
            ));
        }
        if popup.margin < 0 {
            issues.push(ConfigIssue::warning(
                "hub.popup.margin",
                "negative margin places the popup outside the window",
            ));
        }
        if !self.hub.inject_on_init {
            issues.push(ConfigIssue::warning(
                "hub.inject_on_init",
                "pages will never receive the wallet object",
            ));
        }

        issues
    }

    /// Whether validation found any error-level issue.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|i| i.level == IssueLevel::Error)
    }
}

/// Directory holding conduit's configuration.
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs_next::config_dir()
        .or_else(dirs_next::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conduit")
}

/// Default configuration file path.
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load the configuration from the default path.
///
/// A missing file yields the default configuration.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn load_config() -> ConfigResult<ConduitConfig> {
    let path = config_path();
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(ConduitConfig::default());
    }
    load_config_from(&path).await
}

/// Load the configuration from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub async fn load_config_from(path: &Path) -> ConfigResult<ConduitConfig> {
    let content = tokio::fs::read_to_string(path).await?;
    let config: ConduitConfig = serde_json::from_str(&content)?;
    debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Write the configuration to `path`, creating parent directories.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn save_config(config: &ConduitConfig, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;
    info!(path = %path.display(), "config saved");
    Ok(())
}

/// Parse a configuration from a JSON string.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] on malformed JSON.
pub fn parse_config(json: &str) -> ConfigResult<ConduitConfig> {
    serde_json::from_str(json).map_err(ConfigError::from)
}
