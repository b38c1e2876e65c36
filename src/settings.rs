//! Shared settings for the browser-agent CLI.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::agent::{Preferences, RunOptions, Settings};
use crate::browser::CommandDriverConfig;
use crate::model::{ModelConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Planner API base URL
    pub planner_base_url: String,
    /// Planner API key
    pub planner_api_key: String,
    /// Planner model name
    pub planner_model_name: String,
    /// Model the browser-automation tool should use
    pub tool_model: String,
    /// Browser driver command line, e.g. `node driver.js`
    pub driver_command: String,
    /// Checkpoint directory; empty means the platform data directory
    pub checkpoint_dir: String,
    /// Memory file; empty means the platform data directory
    pub memory_path: String,
    /// Maximum retries for planner requests
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
    /// Pause before risky steps
    pub require_approval: bool,
    /// Run the browser without a window
    pub headless: bool,
    /// Engine tuning
    pub engine: Settings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            planner_base_url: "https://api.openai.com/v1".to_string(),
            planner_api_key: "EMPTY".to_string(),
            planner_model_name: "gpt-4o-mini".to_string(),
            tool_model: "gpt-4o-mini".to_string(),
            driver_command: "browser-driver".to_string(),
            checkpoint_dir: String::new(),
            memory_path: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            require_approval: false,
            headless: true,
            engine: Settings::default(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "moderras", "browser-agent")
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Get the data directory path.
    pub fn data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        let loaded = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self::backfill(loaded)
    }

    /// Backfill fields that older config files leave empty or zeroed.
    fn backfill(mut loaded: Self) -> Self {
        let defaults = Self::default();

        if loaded.planner_base_url.is_empty() {
            loaded.planner_base_url = defaults.planner_base_url;
        }
        if loaded.planner_api_key.is_empty() {
            loaded.planner_api_key = defaults.planner_api_key;
        }
        if loaded.planner_model_name.is_empty() {
            loaded.planner_model_name = defaults.planner_model_name;
        }
        if loaded.tool_model.is_empty() {
            loaded.tool_model = defaults.tool_model;
        }
        if loaded.driver_command.trim().is_empty() {
            loaded.driver_command = defaults.driver_command;
        }
        if loaded.engine.max_steps == 0 {
            loaded.engine.max_steps = defaults.engine.max_steps;
        }
        if loaded.engine.max_step_attempts == 0 {
            loaded.engine.max_step_attempts = defaults.engine.max_step_attempts;
        }
        if loaded.engine.loop_guard_threshold == 0 {
            loaded.engine.loop_guard_threshold = defaults.engine.loop_guard_threshold;
        }
        if loaded.engine.loop_guard_window == 0 {
            loaded.engine.loop_guard_window = defaults.engine.loop_guard_window;
        }

        loaded
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Cannot determine config directory")?;

        // Create config directory if it doesn't exist
        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&path, content)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = text("PLANNER_BASE_URL") {
            self.planner_base_url = value;
        }
        if let Some(value) = text("PLANNER_API_KEY") {
            self.planner_api_key = value;
        }
        if let Some(value) = text("PLANNER_MODEL") {
            self.planner_model_name = value;
        }
        if let Some(value) = text("TOOL_MODEL") {
            self.tool_model = value;
        }
        if let Some(value) = text("DRIVER_COMMAND") {
            self.driver_command = value;
        }
        if let Some(value) = text("CHECKPOINT_DIR") {
            self.checkpoint_dir = value;
        }
        if let Some(value) = text("MEMORY_PATH") {
            self.memory_path = value;
        }
        if let Some(flag) = text("REQUIRE_APPROVAL").and_then(|v| parse_flag(&v)) {
            self.require_approval = flag;
        }
        if let Some(flag) = text("HEADLESS").and_then(|v| parse_flag(&v)) {
            self.headless = flag;
        }
        if let Some(max_steps) = text("MAX_STEPS").and_then(|v| v.trim().parse().ok()) {
            self.engine.max_steps = max_steps;
        }
        if let Some(retries) = text("PLANNER_MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.max_retries = retries;
        }
        if let Some(delay) = text("PLANNER_RETRY_DELAY").and_then(|v| v.trim().parse().ok()) {
            self.retry_delay = delay;
        }
    }

    /// Planner model configuration.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.planner_base_url)
            .with_api_key(&self.planner_api_key)
            .with_model_name(&self.planner_model_name)
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
    }

    pub fn preferences(&self) -> Preferences {
        Preferences {
            require_human_approval: self.require_approval,
            headless: self.headless,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            planner_model: self.planner_model_name.clone(),
            tool_model: self.tool_model.clone(),
            settings: self.engine.clone(),
            preferences: self.preferences(),
        }
    }

    pub fn resolved_checkpoint_dir(&self) -> PathBuf {
        if self.checkpoint_dir.is_empty() {
            Self::data_dir()
                .map(|dir| dir.join("runs"))
                .unwrap_or_else(|| PathBuf::from("runs"))
        } else {
            PathBuf::from(&self.checkpoint_dir)
        }
    }

    pub fn resolved_memory_path(&self) -> PathBuf {
        if self.memory_path.is_empty() {
            Self::data_dir()
                .map(|dir| dir.join("memory.json"))
                .unwrap_or_else(|| PathBuf::from("memory.json"))
        } else {
            PathBuf::from(&self.memory_path)
        }
    }

    /// Driver configuration; falls back to the default program when the
    /// command line is blank.
    pub fn driver_config(&self) -> CommandDriverConfig {
        let work_root = Self::data_dir()
            .map(|dir| dir.join("sessions"))
            .unwrap_or_else(|| std::env::temp_dir().join("browser-agent"));
        CommandDriverConfig::from_command_line(&self.driver_command, work_root)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_backfill_older_file() {
        let loaded: AppSettings =
            serde_json::from_str(r#"{"planner_model_name": "", "engine": {"max_steps": 0}}"#)
                .unwrap();
        let settings = AppSettings::backfill(loaded);
        let defaults = AppSettings::default();
        assert_eq!(settings.planner_model_name, defaults.planner_model_name);
        assert_eq!(settings.engine.max_steps, defaults.engine.max_steps);
        assert_eq!(settings.driver_command, "browser-driver");
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(lookup(&[
            ("PLANNER_MODEL", "planner-large"),
            ("DRIVER_COMMAND", "node driver.js --verbose"),
            ("REQUIRE_APPROVAL", "yes"),
            ("HEADLESS", "false"),
            ("MAX_STEPS", "12"),
            ("PLANNER_MAX_RETRIES", "not a number"),
            ("TOOL_MODEL", "  "),
        ]));

        assert_eq!(settings.planner_model_name, "planner-large");
        assert!(settings.require_approval);
        assert!(!settings.headless);
        assert_eq!(settings.engine.max_steps, 12);
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(settings.tool_model, AppSettings::default().tool_model);

        let driver = settings.driver_config();
        assert_eq!(driver.program, "node");
        assert_eq!(driver.args, vec!["driver.js", "--verbose"]);
    }

    #[test]
    fn test_conversions() {
        let mut settings = AppSettings::default();
        settings.checkpoint_dir = "/tmp/runs".into();
        settings.require_approval = true;

        let options = settings.run_options();
        assert_eq!(options.planner_model, settings.planner_model_name);
        assert!(options.preferences.require_human_approval);
        assert_eq!(options.settings, settings.engine);
        assert_eq!(settings.resolved_checkpoint_dir(), PathBuf::from("/tmp/runs"));

        let model = settings.model_config();
        assert_eq!(model.base_url, settings.planner_base_url);
        assert_eq!(model.max_retries, settings.max_retries);
    }
}
