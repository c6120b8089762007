//! Voice profile registry.
//!
//! Built-in voices are compiled in and can never be replaced or removed.
//! User-added voices live in a JSON file that is rewritten whole on every
//! change. [`VoiceLibrary`] hands out immutable snapshots so running sessions
//! never observe a half-applied update.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tokio::sync::Mutex;

use crate::core::error::PipelineError;

pub const CUSTOM_VOICE_NAME: &str = "Custom";

static VOICE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-zA-Z0-9]{20,})\b").expect("valid voice id pattern"));
const CANDIDATE_CONTEXT_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub name: String,
    #[serde(rename = "id")]
    pub backend_id: String,
}

impl VoiceProfile {
    pub fn new(name: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend_id: backend_id.into(),
        }
    }

    /// A raw backend voice id that is not in the registry.
    pub fn custom(backend_id: impl Into<String>) -> Self {
        Self::new(CUSTOM_VOICE_NAME, backend_id)
    }
}

pub type VoiceMap = BTreeMap<String, VoiceProfile>;

pub fn builtin_voices() -> VoiceMap {
    [
        ("1", "James", "ztnpYzQJyWffPj1VC5Uw"),
        ("2", "Melissa", "27ximz35zKCDKjbjZGNt"),
        ("3", "Default", "hWUa9vMm0D2rSFio6QYm"),
    ]
    .into_iter()
    .map(|(key, name, id)| (key.to_string(), VoiceProfile::new(name, id)))
    .collect()
}

#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    builtins: VoiceMap,
    custom: VoiceMap,
}

impl VoiceRegistry {
    pub fn new(builtins: VoiceMap, custom: VoiceMap) -> Self {
        let custom = custom
            .into_iter()
            .filter(|(key, _)| {
                let shadowed = builtins.contains_key(key);
                if shadowed {
                    log::warn!("Ignoring saved voice #{}: key is reserved for a built-in voice", key);
                }
                !shadowed
            })
            .collect();
        Self { builtins, custom }
    }

    #[cfg(test)]
    pub fn with_builtins() -> Self {
        Self::new(builtin_voices(), VoiceMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&VoiceProfile> {
        self.builtins.get(key).or_else(|| self.custom.get(key))
    }

    pub fn is_builtin(&self, key: &str) -> bool {
        self.builtins.contains_key(key)
    }

    /// Registry key lookup, falling back to a raw backend id named "Custom".
    pub fn resolve(&self, token: &str) -> VoiceProfile {
        let token = token.trim();
        self.get(token)
            .cloned()
            .unwrap_or_else(|| VoiceProfile::custom(token))
    }

    /// All voices, numeric keys first in numeric order.
    pub fn entries(&self) -> Vec<(&str, &VoiceProfile)> {
        let mut entries: Vec<(&str, &VoiceProfile)> = self
            .builtins
            .iter()
            .chain(self.custom.iter())
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            match (a.parse::<u64>(), b.parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => a.cmp(b),
            }
        });
        entries
    }

    pub fn custom(&self) -> &VoiceMap {
        &self.custom
    }

    pub fn next_key(&self) -> String {
        let max = self
            .builtins
            .keys()
            .chain(self.custom.keys())
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    pub fn knows_backend_id(&self, backend_id: &str) -> bool {
        self.builtins
            .values()
            .chain(self.custom.values())
            .any(|v| v.backend_id == backend_id)
    }

    fn insert_custom(&mut self, profile: VoiceProfile) -> String {
        let key = self.next_key();
        self.custom.insert(key.clone(), profile);
        key
    }

    fn remove_custom(&mut self, key: &str) -> Result<VoiceProfile, PipelineError> {
        if self.is_builtin(key) {
            return Err(PipelineError::ProtectedVoice(key.to_string()));
        }
        self.custom
            .remove(key)
            .ok_or_else(|| PipelineError::UnknownVoice(key.to_string()))
    }
}

#[async_trait]
pub trait VoiceStore: Send + Sync {
    async fn load(&self) -> Result<VoiceMap>;
    /// Replaces the stored user-added voices.
    async fn save(&self, custom: &VoiceMap) -> Result<()>;
}

pub struct JsonVoiceStore {
    path: PathBuf,
}

impl JsonVoiceStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl VoiceStore for JsonVoiceStore {
    async fn load(&self) -> Result<VoiceMap> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(VoiceMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    async fn save(&self, custom: &VoiceMap) -> Result<()> {
        let content = serde_json::to_string_pretty(custom)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Result of a registry mutation. The in-memory change always applies;
/// `write_error` reports a failed save.
#[derive(Debug)]
pub struct Persisted<T> {
    pub value: T,
    pub write_error: Option<PipelineError>,
}

pub struct VoiceLibrary {
    current: RwLock<Arc<VoiceRegistry>>,
    writer: Mutex<()>,
    store: Box<dyn VoiceStore>,
}

impl VoiceLibrary {
    pub async fn load(store: Box<dyn VoiceStore>) -> Self {
        let custom = store.load().await.unwrap_or_else(|e| {
            log::warn!("Error loading voices, using built-in voices only: {:#}", e);
            VoiceMap::new()
        });
        let registry = VoiceRegistry::new(builtin_voices(), custom);
        log::info!(
            "Available voices: {}",
            registry
                .entries()
                .iter()
                .map(|(_, v)| v.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            current: RwLock::new(Arc::new(registry)),
            writer: Mutex::new(()),
            store,
        }
    }

    pub fn snapshot(&self) -> Arc<VoiceRegistry> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn add(&self, name: &str, backend_id: &str) -> Persisted<(String, VoiceProfile)> {
        let _guard = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let profile = VoiceProfile::new(name, backend_id);
        let key = next.insert_custom(profile.clone());
        log::info!("Added voice {} (#{}) with id {}", name, key, backend_id);
        let write_error = self.commit(next).await;
        Persisted {
            value: (key, profile),
            write_error,
        }
    }

    pub async fn remove(&self, key: &str) -> Result<Persisted<VoiceProfile>, PipelineError> {
        let _guard = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let removed = next.remove_custom(key)?;
        log::info!("Removed voice {} (#{})", removed.name, key);
        let write_error = self.commit(next).await;
        Ok(Persisted {
            value: removed,
            write_error,
        })
    }

    /// Callers hold `writer`.
    async fn commit(&self, next: VoiceRegistry) -> Option<PipelineError> {
        let saved = self.store.save(next.custom()).await;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        match saved {
            Ok(()) => None,
            Err(e) => {
                log::warn!("Error saving voices: {:#}", e);
                Some(PipelineError::RegistryWrite(e))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCandidate {
    pub id: String,
    pub context: String,
}

/// Scans messages for tokens that look like backend voice ids and are not
/// registered yet.
pub fn find_voice_candidates(
    messages: &[String],
    registry: &VoiceRegistry,
    max: usize,
) -> Vec<VoiceCandidate> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for message in messages {
        for caps in VOICE_ID.captures_iter(message) {
            let Some(m) = caps.get(1) else { continue };
            let id = m.as_str();
            if registry.knows_backend_id(id) || !seen.insert(id.to_string()) {
                continue;
            }
            found.push(VoiceCandidate {
                id: id.to_string(),
                context: message.chars().take(CANDIDATE_CONTEXT_CHARS).collect(),
            });
            if found.len() >= max {
                return found;
            }
        }
    }
    found
}
