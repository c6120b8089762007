use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::tts::elevenlabs::ElevenLabsConfig;

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_work")]
    pub work_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_voices_file")]
    pub voices_file: String,

    #[serde(default)]
    pub document: DocumentConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub negotiation: NegotiationConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DocumentConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_seconds: u64,
    /// Tokens allowed between a `Script #N` header and its content.
    #[serde(default = "default_annotation_tokens")]
    pub annotation_tokens: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_target_words")]
    pub target_words: usize,
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
    /// Overrides the backend's own concurrency limit.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NegotiationConfig {
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(default = "default_audio_format")]
    pub format: String,
    pub elevenlabs: Option<ElevenLabsConfig>,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_fetch_timeout(),
            annotation_tokens: default_annotation_tokens(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            hard_cap: default_hard_cap(),
            concurrency: None,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_negotiation_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            format: default_audio_format(),
            elevenlabs: None,
        }
    }
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_work() -> String {
    "build".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_voices_file() -> String {
    "voices.json".to_string()
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_annotation_tokens() -> Vec<String> {
    vec!["INSPO".to_string()]
}
fn default_target_words() -> usize {
    55
}
fn default_hard_cap() -> usize {
    60
}
fn default_negotiation_timeout() -> u64 {
    60
}
fn default_max_attempts() -> usize {
    1
}
fn default_tts_provider() -> String {
    "elevenlabs".to_string()
}
fn default_audio_format() -> String {
    "mp3".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_folder: default_work(),
            output_folder: default_output(),
            voices_file: default_voices_file(),
            document: DocumentConfig::default(),
            generation: GenerationConfig::default(),
            negotiation: NegotiationConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", CONFIG_FILE);
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.work_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}
