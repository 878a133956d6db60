use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::transcriber::TranscribeOptions;

/// Hub repository that hosts the ggml weights.
pub const MODEL_REPO: &str = "ggerganov/whisper.cpp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WhisperModel {
    TinyEn,
    #[default]
    BaseEn,
    SmallEn,
    Tiny,
    Base,
    Small,
}

impl WhisperModel {
    pub fn filename(&self) -> &'static str {
        match self {
            Self::TinyEn => "ggml-tiny.en.bin",
            Self::BaseEn => "ggml-base.en.bin",
            Self::SmallEn => "ggml-small.en.bin",
            Self::Tiny => "ggml-tiny.bin",
            Self::Base => "ggml-base.bin",
            Self::Small => "ggml-small.bin",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TinyEn => "tiny.en",
            Self::BaseEn => "base.en",
            Self::SmallEn => "small.en",
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
        }
    }

    pub fn is_english_only(&self) -> bool {
        matches!(self, Self::TinyEn | Self::BaseEn | Self::SmallEn)
    }

    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/{}/resolve/main/{}",
            MODEL_REPO,
            self.filename()
        )
    }
}

impl FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', ".");
        match normalized.as_str() {
            "tiny.en" => Ok(Self::TinyEn),
            "base.en" => Ok(Self::BaseEn),
            "small.en" => Ok(Self::SmallEn),
            "tiny" => Ok(Self::Tiny),
            "base" => Ok(Self::Base),
            "small" => Ok(Self::Small),
            other => Err(format!(
                "unknown model '{other}' (expected tiny.en, base.en, small.en, tiny, base or small)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: WhisperModel,
    /// Explicit weights file; bypasses `models_dir` and downloading
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    #[serde(default = "default_auto_download")]
    pub auto_download: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub translate: bool,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub use_gpu: bool,
    #[serde(default)]
    pub vad_enabled: bool,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_auto_download() -> bool {
    true
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_min_samples() -> usize {
    1600
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: WhisperModel::default(),
            model_path: None,
            models_dir: None,
            auto_download: default_auto_download(),
            language: None,
            translate: false,
            timestamps: false,
            threads: None,
            use_gpu: false,
            vad_enabled: false,
            vad_threshold: default_vad_threshold(),
            min_samples: default_min_samples(),
            idle_timeout_secs: default_idle_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".speech-worker")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("models"))
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| self.models_dir().join(self.model.filename()))
    }

    pub fn threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| num_cpus::get() / 2)
            .max(1)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// English-only is only known for catalogue models; custom weights are
    /// checked by the transcriber once loaded.
    fn english_only(&self) -> bool {
        self.model_path.is_none() && self.model.is_english_only()
    }

    pub fn transcribe_options(&self) -> TranscribeOptions {
        let language = if self.english_only() {
            Some("en".to_string())
        } else {
            self.language.clone()
        };
        TranscribeOptions {
            language,
            translate: self.translate && !self.english_only(),
            timestamps: self.timestamps,
            threads: self.threads(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.model, WhisperModel::BaseEn);
        assert!(config.auto_download);
        assert!(!config.vad_enabled);
        assert_eq!(config.min_samples, 1600);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert!(config.threads() >= 1);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str("model = \"small\"\nlanguage = \"de\"\n").unwrap();
        assert_eq!(config.model, WhisperModel::Small);
        assert_eq!(config.language.as_deref(), Some("de"));
        assert_eq!(config.vad_threshold, 0.5);
        assert_eq!(config.idle_timeout_secs, 300);
    }

    #[test]
    fn test_load_from_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let mut changed = config.clone();
        changed.model = WhisperModel::Tiny;
        changed.translate = true;
        changed.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), changed);
    }

    #[test]
    fn test_model_path_prefers_explicit_file() {
        let mut config = Config::default();
        config.models_dir = Some(PathBuf::from("/opt/models"));
        assert_eq!(config.model_path(), PathBuf::from("/opt/models/ggml-base.en.bin"));

        config.model_path = Some(PathBuf::from("/tmp/custom.bin"));
        assert_eq!(config.model_path(), PathBuf::from("/tmp/custom.bin"));
    }

    #[test]
    fn test_model_parses_labels() {
        assert_eq!("base.en".parse::<WhisperModel>(), Ok(WhisperModel::BaseEn));
        assert_eq!("TINY_EN".parse::<WhisperModel>(), Ok(WhisperModel::TinyEn));
        assert_eq!("small".parse::<WhisperModel>(), Ok(WhisperModel::Small));
        assert!("large".parse::<WhisperModel>().is_err());
    }

    #[test]
    fn test_download_url() {
        assert_eq!(
            WhisperModel::Tiny.download_url(),
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin"
        );
    }

    #[test]
    fn test_english_only_models_force_english() {
        let mut config = Config::default();
        config.language = Some("fr".into());
        config.translate = true;
        let options = config.transcribe_options();
        assert_eq!(options.language.as_deref(), Some("en"));
        assert!(!options.translate);

        config.model = WhisperModel::Base;
        let options = config.transcribe_options();
        assert_eq!(options.language.as_deref(), Some("fr"));
        assert!(options.translate);
    }

    #[test]
    fn test_custom_weights_keep_requested_language() {
        let config = Config {
            model_path: Some(PathBuf::from("/models/ggml-large-v3.bin")),
            language: Some("de".into()),
            translate: true,
            ..Config::default()
        };
        let options = config.transcribe_options();
        assert_eq!(options.language.as_deref(), Some("de"));
        assert!(options.translate);
    }

    #[test]
    fn test_zero_idle_timeout_disables_unload() {
        let mut config = Config::default();
        config.idle_timeout_secs = 0;
        assert_eq!(config.idle_timeout(), None);
    }
}
