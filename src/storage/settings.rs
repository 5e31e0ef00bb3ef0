//! Settings storage
//!
//! Manages persistence of session preferences.

use crate::inference::{SamplingParams, SessionParams};
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Model file used when none is given on the command line
    pub model_path: Option<PathBuf>,
    /// Chat template; `None` uses the template embedded in the model
    pub chat_template: Option<String>,
    /// Context window size (0 = taken from the model)
    pub context_size: u32,
    /// Min-p sampling parameter (0.0 - 1.0)
    pub min_p: f32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Sampler seed (0 = random)
    pub seed: u32,
    /// Keep user and assistant turns between responses
    pub store_history: bool,
    /// Threads used for decoding
    pub n_threads: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// System prompt added to new conversations
    pub system_prompt: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            chat_template: None,
            context_size: 0,
            min_p: 0.1,
            temperature: 0.8,
            seed: 0,
            store_history: true,
            n_threads: 4,
            use_mmap: true,
            use_mlock: false,
            gpu_layers: 0,
            system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

impl SessionSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        // Clamp temperature between 0.0 and 2.0
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Clamp min_p between 0.0 and 1.0
        self.min_p = self.min_p.clamp(0.0, 1.0);

        if self.n_threads == 0 {
            self.n_threads = 1;
        }

        if self
            .chat_template
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            self.chat_template = None;
        }
    }

    /// Builds handle parameters for the model at `model_path`
    pub fn to_session_params(&self, model_path: impl Into<PathBuf>) -> SessionParams {
        SessionParams {
            model_path: model_path.into(),
            sampling: SamplingParams {
                min_p: self.min_p,
                temperature: self.temperature,
                seed: self.seed,
            },
            store_history: self.store_history,
            context_size: (self.context_size > 0).then_some(self.context_size),
            chat_template: self.chat_template.clone(),
            n_threads: i32::try_from(self.n_threads).ok(),
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            gpu_layers: self.gpu_layers,
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> SessionSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            SessionSettings::default()
        }
    }
}

/// Loads and validates settings from `path`; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<SessionSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(SessionSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: SessionSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &SessionSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &SessionSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.min_p, 0.1);
        assert_eq!(settings.temperature, 0.8);
        assert_eq!(settings.n_threads, 4);
        assert!(settings.store_history);
        assert!(settings.use_mmap);
        assert!(!settings.use_mlock);
        assert_eq!(settings.system_prompt, "You are a helpful assistant.");
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = SessionSettings::default();

        // Test temperature clamping
        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        settings.min_p = 2.0;
        settings.n_threads = 0;
        settings.chat_template = Some("   ".to_string());
        settings.validate();
        assert_eq!(settings.min_p, 1.0);
        assert_eq!(settings.n_threads, 1);
        assert_eq!(settings.chat_template, None);
    }

    #[test]
    fn test_to_session_params() {
        let mut settings = SessionSettings::default();
        let params = settings.to_session_params("model.gguf");
        assert_eq!(params.model_path, PathBuf::from("model.gguf"));
        assert_eq!(params.context_size, None);
        assert_eq!(params.n_threads, Some(4));
        assert_eq!(params.sampling.temperature, 0.8);

        settings.context_size = 2048;
        settings.store_history = false;
        let params = settings.to_session_params("model.gguf");
        assert_eq!(params.context_size, Some(2048));
        assert!(!params.store_history);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "temperature": 9.0, "store_history": false }"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.temperature, 2.0);
        assert!(!settings.store_history);
        assert_eq!(settings.min_p, 0.1);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, SessionSettings::default());
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = SessionSettings {
            model_path: Some(PathBuf::from("/models/tiny.gguf")),
            context_size: 1024,
            ..SessionSettings::default()
        };
        save_settings_to(&settings, &path).unwrap();

        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }
}
