use std::fmt;

use crate::core::script::ScriptKey;

/// Failure of a single paragraph's synthesis call.
#[derive(Debug)]
pub struct SynthesisError {
    pub index: usize,
    pub source: anyhow::Error,
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "paragraph {} failed: {:#}", self.index + 1, self.source)
    }
}

impl std::error::Error for SynthesisError {}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to fetch document: {0:#}")]
    Fetch(anyhow::Error),
    #[error("no scripts found in the document")]
    NoScripts,
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
    #[error("no reply within {seconds}s while waiting for {round}")]
    NegotiationTimeout { round: String, seconds: u64 },
    #[error("conversation closed during negotiation")]
    ConversationClosed,
    #[error("generation stopped by request")]
    Cancelled,
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error("nothing to stitch for script #{0}")]
    EmptyInput(ScriptKey),
    #[error("failed to persist voice registry: {0:#}")]
    RegistryWrite(anyhow::Error),
    #[error("voice #{0} is built in and cannot be changed")]
    ProtectedVoice(String),
    #[error("voice #{0} not found")]
    UnknownVoice(String),
    #[error("a generation session is already active for {0}")]
    SessionBusy(String),
    #[error("no active generation session for {0}")]
    NoActiveSession(String),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
    #[error("audio codec error: {0:#}")]
    Codec(anyhow::Error),
}
