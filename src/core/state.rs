use crate::core::io::ArtifactHandle;
use crate::core::script::ScriptKey;
use crate::core::voices::VoiceProfile;

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Generating,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub script: ScriptKey,
    pub text: String,
    pub voices: Vec<VoiceProfile>,
}

/// Ordered (script, voices) pairs chosen during negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    entries: Vec<PlanEntry>,
}

impl WorkPlan {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn script_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pair_count(&self) -> usize {
        self.entries.iter().map(|e| e.voices.len()).sum()
    }
}

/// Synthesized audio for one paragraph, stored at `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub index: usize,
    pub handle: ArtifactHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub handle: ArtifactHandle,
    pub size: usize,
}

/// Suggested delivery name, `script_<key>_<voice_name>.<ext>`.
pub fn artifact_filename(script: ScriptKey, voice_name: &str, extension: &str) -> String {
    let voice: String = voice_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!("script_{}_{}.{}", script, voice, extension)
}

/// `filename`, or `stem_2.ext`, `stem_3.ext`... when it is already `taken`.
/// Two raw voice ids on one script both resolve to "Custom".
pub fn unique_filename(filename: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == filename) {
        return filename.to_string();
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{}", ext)),
        None => (filename, String::new()),
    };
    (2..)
        .map(|n| format!("{}_{}{}", stem, n, ext))
        .find(|candidate| !taken.iter().any(|t| t == candidate))
        .unwrap_or_else(|| filename.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRef {
    pub script: ScriptKey,
    pub voice: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub delivered: Vec<String>,
    pub skipped: Vec<PairRef>,
    pub failed: Vec<PairRef>,
}

impl SessionOutcome {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            delivered: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }
}
