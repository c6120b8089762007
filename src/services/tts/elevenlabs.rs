use crate::services::tts::TtsBackend;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    /// Falls back to the `ELEVENLABS_API_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_output_format() -> String {
    "mp3_44100_128".to_string()
}
fn default_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_concurrency() -> usize {
    3
}
fn default_timeout() -> u64 {
    120
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_id: default_model_id(),
            output_format: default_output_format(),
            base_url: default_base_url(),
            concurrency: default_concurrency(),
            timeout_seconds: default_timeout(),
        }
    }
}

// --- Client ---

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct ElevenLabsClient {
    config: ElevenLabsConfig,
    api_key: String,
    client: reqwest::Client,
}

impl ElevenLabsClient {
    pub fn new(config: ElevenLabsConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .ok_or_else(|| anyhow!("{} not found in config or environment", API_KEY_ENV))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn speech_url(&self, voice_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .with_context(|| format!("Invalid ElevenLabs base URL: {}", self.config.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("ElevenLabs base URL cannot have a path"))?
            .pop_if_empty()
            .extend(["v1", "text-to-speech", voice_id]);
        url.query_pairs_mut()
            .append_pair("output_format", &self.config.output_format);
        Ok(url)
    }
}

#[async_trait]
impl TtsBackend for ElevenLabsClient {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        let url = self.speech_url(voice_id)?;
        debug!("ElevenLabs request: {} chars with voice {}", text.len(), voice_id);

        let body = SpeechRequest {
            text,
            model_id: &self.config.model_id,
        };
        let resp = self
            .client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ElevenLabs API error ({}): {}", status, err_text));
        }

        Ok(resp.bytes().await?.to_vec())
    }

    fn max_concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> ElevenLabsClient {
        ElevenLabsClient::new(ElevenLabsConfig {
            api_key: Some("key".to_string()),
            base_url: base_url.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_speech_url() -> Result<()> {
        let url = client("https://api.elevenlabs.io/").speech_url("ztnpYzQJyWffPj1VC5Uw")?;
        assert_eq!(
            url.as_str(),
            "https://api.elevenlabs.io/v1/text-to-speech/ztnpYzQJyWffPj1VC5Uw?output_format=mp3_44100_128"
        );
        Ok(())
    }

    #[test]
    fn test_custom_voice_id_is_escaped() -> Result<()> {
        let url = client("http://localhost:9000").speech_url("a b/c")?;
        assert_eq!(url.path(), "/v1/text-to-speech/a%20b%2Fc");
        Ok(())
    }

    #[test]
    fn test_concurrency_never_zero() {
        let c = ElevenLabsClient::new(ElevenLabsConfig {
            api_key: Some("key".to_string()),
            concurrency: 0,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(c.max_concurrency(), 1);
    }
}
