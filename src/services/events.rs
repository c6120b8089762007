use async_trait::async_trait;

use crate::core::script::ScriptKey;
use crate::core::state::{SessionOutcome, WorkPlan};

/// A question the user must answer before generation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    ChooseScripts {
        available: Vec<ScriptKey>,
    },
    /// `voices` lists `(key, name)` pairs in display order.
    ChooseVoices {
        script: ScriptKey,
        voices: Vec<(String, String)>,
    },
}

/// Audio ready for delivery, already read out of temporary storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredArtifact {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Notice(String),
    Prompt(Prompt),
    ScriptsSelected(Vec<ScriptKey>),
    VoicesSelected {
        script: ScriptKey,
        voices: Vec<String>,
    },
    PlanReady {
        scripts: usize,
        pairs: usize,
    },
    PairStarted {
        script: ScriptKey,
        voice: String,
        paragraphs: usize,
    },
    ParagraphSynthesized {
        done: usize,
        total: usize,
    },
    PairCompleted {
        script: ScriptKey,
        voice: String,
        artifact: DeliveredArtifact,
    },
    PairSkipped {
        script: ScriptKey,
        voice: String,
    },
    ScriptSkipped(ScriptKey),
    PairStopped {
        script: ScriptKey,
        voice: String,
    },
    PairFailed {
        script: ScriptKey,
        voice: String,
        error: String,
    },
    Finished(SessionOutcome),
}

impl SessionEvent {
    pub fn plan_ready(plan: &WorkPlan) -> Self {
        SessionEvent::PlanReady {
            scripts: plan.script_count(),
            pairs: plan.pair_count(),
        }
    }
}

/// Where session progress goes. Delivery is best effort; a gone listener
/// never fails the pipeline.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SessionEvent);
}
