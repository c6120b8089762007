//! Interactive plan selection: which scripts, then which voices per script.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::PipelineError;
use crate::core::script::{ScriptKey, Scripts};
use crate::core::state::{PlanEntry, WorkPlan};
use crate::core::voices::{VoiceProfile, VoiceRegistry};
use crate::services::events::{EventSink, Prompt, SessionEvent};

pub const SELECT_ALL: &str = "all";

/// Parses a script selection: `all` or comma-separated keys that must all
/// exist. Keys come back deduplicated in the order given.
pub fn parse_script_selection(
    reply: &str,
    scripts: &Scripts,
) -> Result<Vec<ScriptKey>, PipelineError> {
    let reply = reply.trim();
    if reply.eq_ignore_ascii_case(SELECT_ALL) {
        return Ok(scripts.keys().copied().collect());
    }

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for token in reply.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let key: ScriptKey = token
            .parse()
            .map_err(|_| PipelineError::InvalidSelection(format!("'{}' is not a script number", token)))?;
        if !scripts.contains_key(&key) {
            return Err(PipelineError::InvalidSelection(format!(
                "script #{} does not exist",
                key
            )));
        }
        if seen.insert(key) {
            selected.push(key);
        }
    }

    if selected.is_empty() {
        return Err(PipelineError::InvalidSelection(
            "no scripts selected".to_string(),
        ));
    }
    Ok(selected)
}

/// Resolves comma-separated voice tokens against the registry. Unknown tokens
/// become raw backend ids. Empty tokens are ignored.
pub fn parse_voice_selection(
    reply: &str,
    registry: &VoiceRegistry,
) -> Result<Vec<VoiceProfile>, PipelineError> {
    let voices: Vec<VoiceProfile> = reply
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| registry.resolve(t))
        .collect();
    if voices.is_empty() {
        return Err(PipelineError::InvalidSelection(
            "no voices selected".to_string(),
        ));
    }
    Ok(voices)
}

pub struct Negotiator {
    timeout: Duration,
    max_attempts: usize,
}

impl Negotiator {
    pub fn new(timeout: Duration, max_attempts: usize) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs both selection rounds. Any error leaves no plan behind; a
    /// cancelled `stop` ends the wait for a reply with `Cancelled`.
    pub async fn negotiate(
        &self,
        scripts: &Scripts,
        registry: &VoiceRegistry,
        replies: &mut mpsc::Receiver<String>,
        stop: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<WorkPlan, PipelineError> {
        let selected = self
            .ask(
                "script selection",
                Prompt::ChooseScripts {
                    available: scripts.keys().copied().collect(),
                },
                replies,
                stop,
                sink,
                |reply| parse_script_selection(reply, scripts),
            )
            .await?;
        sink.emit(SessionEvent::ScriptsSelected(selected.clone())).await;

        let voice_menu: Vec<(String, String)> = registry
            .entries()
            .into_iter()
            .map(|(key, profile)| (key.to_string(), profile.name.clone()))
            .collect();

        let mut entries = Vec::with_capacity(selected.len());
        for script in selected {
            let Some(text) = scripts.get(&script) else {
                continue;
            };
            let voices = self
                .ask(
                    &format!("voice selection for script #{}", script),
                    Prompt::ChooseVoices {
                        script,
                        voices: voice_menu.clone(),
                    },
                    replies,
                    stop,
                    sink,
                    |reply| parse_voice_selection(reply, registry),
                )
                .await?;
            sink.emit(SessionEvent::VoicesSelected {
                script,
                voices: voices.iter().map(|v| v.name.clone()).collect(),
            })
            .await;
            entries.push(PlanEntry {
                script,
                text: text.clone(),
                voices,
            });
        }

        Ok(WorkPlan::new(entries))
    }

    async fn ask<T>(
        &self,
        round: &str,
        prompt: Prompt,
        replies: &mut mpsc::Receiver<String>,
        stop: &CancellationToken,
        sink: &dyn EventSink,
        parse: impl Fn(&str) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut attempt = 1;
        loop {
            sink.emit(SessionEvent::Prompt(prompt.clone())).await;

            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(PipelineError::Cancelled),
                received = tokio::time::timeout(self.timeout, replies.recv()) => received,
            };
            let reply = match received {
                Ok(Some(reply)) => reply,
                Ok(None) => return Err(PipelineError::ConversationClosed),
                Err(_) => {
                    log::warn!("Timed out waiting for {}", round);
                    return Err(PipelineError::NegotiationTimeout {
                        round: round.to_string(),
                        seconds: self.timeout.as_secs(),
                    });
                }
            };

            match parse(&reply) {
                Err(PipelineError::InvalidSelection(reason)) if attempt < self.max_attempts => {
                    log::debug!("Invalid reply during {}: {}", round, reason);
                    sink.emit(SessionEvent::Notice(format!(
                        "Invalid selection: {}. Please try again.",
                        reason
                    )))
                    .await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
