use crate::core::config::Config;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Remote text-to-speech backend. Implementations enforce their own rate
/// limits and never retry.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>>;

    fn max_concurrency(&self) -> usize {
        DEFAULT_MAX_CONCURRENCY
    }
}

pub fn create_tts_backend(config: &Config) -> Result<Arc<dyn TtsBackend>> {
    info!("Initializing TTS backend for provider: {}", config.audio.provider);
    match config.audio.provider.as_str() {
        "elevenlabs" => {
            let eleven_config = config.audio.elevenlabs.clone().unwrap_or_default();
            Ok(Arc::new(elevenlabs::ElevenLabsClient::new(eleven_config)?))
        }
        _ => Err(anyhow!("Unknown TTS provider: {}", config.audio.provider)),
    }
}

pub mod elevenlabs;
