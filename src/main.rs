use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use script2audio::core::config::Config;
use script2audio::core::io::{NativeStorage, Storage};
use script2audio::core::voices::{JsonVoiceStore, VoiceLibrary};
use script2audio::services::controller::{SessionManager, SessionSettings};
use script2audio::services::document::HttpDocumentFetcher;
use script2audio::services::stitcher::Stitcher;
use script2audio::services::synthesis::SynthesisPool;
use script2audio::services::tts::create_tts_backend;
use script2audio::ui;
use script2audio::utils::audio::create_codec;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid audio settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let voices = Arc::new(
        VoiceLibrary::load(Box::new(JsonVoiceStore::new(&config.voices_file))).await,
    );

    let backend = create_tts_backend(&config)?;
    let workers = config
        .generation
        .concurrency
        .unwrap_or_else(|| backend.max_concurrency());

    let codec = create_codec(&config.audio.format)?;
    let fetcher = Arc::new(HttpDocumentFetcher::new(Duration::from_secs(
        config.document.timeout_seconds,
    ))?);

    let pool = SynthesisPool::new(backend, storage.clone(), workers);
    log::info!("Synthesis pool: {} workers", pool.workers());

    let manager = Arc::new(SessionManager::new(
        SessionSettings::from_config(&config),
        voices,
        fetcher,
        pool,
        Stitcher::new(codec, storage.clone()),
        storage,
    ));

    ui::console::run(manager, &config.output_folder).await
}
