//! The session controller: one state machine per user that negotiates a plan
//! and then walks it pair by pair through segmentation, synthesis and
//! stitching while honouring stop and skip requests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::config::Config;
use crate::core::error::{PipelineError, SynthesisError};
use crate::core::io::{ArtifactHandle, Storage};
use crate::core::script::{parse_scripts, ScriptKey};
use crate::core::segmenter::{segment, SegmentLimits};
use crate::core::state::{
    artifact_filename, unique_filename, AudioSegment, PairRef, PlanEntry, SessionOutcome,
    SessionState, WorkPlan,
};
use crate::core::voices::{
    find_voice_candidates, Persisted, VoiceCandidate, VoiceLibrary, VoiceProfile, VoiceRegistry,
};
use crate::services::document::DocumentFetcher;
use crate::services::events::{DeliveredArtifact, EventSink, SessionEvent};
use crate::services::negotiator::Negotiator;
use crate::services::session::{Interrupt, SessionHandle, SessionStore};
use crate::services::stitcher::Stitcher;
use crate::services::synthesis::{reassemble, SynthesisJob, SynthesisOutput, SynthesisPool};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub work_folder: String,
    pub limits: SegmentLimits,
    pub annotation_tokens: Vec<String>,
    pub negotiation_timeout: Duration,
    pub max_attempts: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_folder: config.work_folder.clone(),
            limits: SegmentLimits {
                target_words: config.generation.target_words,
                hard_cap: config.generation.hard_cap,
            },
            annotation_tokens: config.document.annotation_tokens.clone(),
            negotiation_timeout: config.negotiation.timeout(),
            max_attempts: config.negotiation.max_attempts,
        }
    }
}

enum PairResult {
    Delivered(String),
    Interrupted(Interrupt),
    Failed(PipelineError),
}

/// A registered session plus what is needed to tear it down. Dropping an
/// unclosed lease stops the session and cleans up in the background.
struct SessionLease {
    handle: Arc<SessionHandle>,
    sessions: Arc<SessionStore>,
    storage: Arc<dyn Storage>,
    folder: String,
    closed: bool,
}

impl SessionLease {
    fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        log::warn!(
            "Session for {} abandoned before finishing, cleaning up",
            self.handle.user()
        );
        self.handle.request_stop();
        self.handle.tasks().close();

        let handle = self.handle.clone();
        let sessions = self.sessions.clone();
        let storage = self.storage.clone();
        let folder = std::mem::take(&mut self.folder);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    handle.tasks().wait().await;
                    for artifact in handle.take_owned() {
                        if let Err(e) = storage.delete(&artifact).await {
                            log::warn!("Failed to delete temporary file {}: {:#}", artifact, e);
                        }
                    }
                    if let Err(e) = storage.delete(&folder).await {
                        log::warn!("Failed to clean up {}: {:#}", folder, e);
                    }
                    handle.set_current(None);
                    handle.set_state(SessionState::Stopped);
                    sessions.remove(&handle);
                });
            }
            Err(_) => {
                log::warn!("No runtime to clean up {}, leaving files behind", folder);
                sessions.remove(&handle);
            }
        }
    }
}

/// A negotiated plan bound to the session that will generate it. Dropping it
/// without [`SessionManager::run`] closes the session.
pub struct NegotiatedPlan {
    lease: SessionLease,
    plan: WorkPlan,
}

impl NegotiatedPlan {
    pub fn plan(&self) -> &WorkPlan {
        &self.plan
    }

    pub fn user(&self) -> &str {
        self.lease.handle.user()
    }
}

/// Per-pair synthesis results and the progress reported so far.
struct Progress {
    outputs: Vec<SynthesisOutput>,
    done: usize,
    total: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            outputs: Vec::with_capacity(total),
            done: 0,
            total,
        }
    }

    async fn record(&mut self, output: SynthesisOutput, sink: &dyn EventSink) {
        if output.result.is_ok() {
            self.done += 1;
            sink.emit(SessionEvent::ParagraphSynthesized {
                done: self.done,
                total: self.total,
            })
            .await;
        }
        self.outputs.push(output);
    }
}

pub struct SessionManager {
    settings: SessionSettings,
    sessions: Arc<SessionStore>,
    voices: Arc<VoiceLibrary>,
    fetcher: Arc<dyn DocumentFetcher>,
    pool: SynthesisPool,
    stitcher: Stitcher,
    storage: Arc<dyn Storage>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        voices: Arc<VoiceLibrary>,
        fetcher: Arc<dyn DocumentFetcher>,
        pool: SynthesisPool,
        stitcher: Stitcher,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            settings,
            sessions: Arc::new(SessionStore::new()),
            voices,
            fetcher,
            pool,
            stitcher,
            storage,
        }
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn signal_stop(&self, user: &str) -> Result<(), PipelineError> {
        self.sessions.signal_stop(user)
    }

    pub fn signal_skip(&self, user: &str) -> Result<Option<ScriptKey>, PipelineError> {
        self.sessions.signal_skip(user)
    }

    pub fn voices(&self) -> Arc<VoiceRegistry> {
        self.voices.snapshot()
    }

    pub async fn add_voice(
        &self,
        name: &str,
        backend_id: &str,
    ) -> Persisted<(String, VoiceProfile)> {
        self.voices.add(name, backend_id).await
    }

    pub async fn remove_voice(
        &self,
        key: &str,
    ) -> Result<Persisted<VoiceProfile>, PipelineError> {
        self.voices.remove(key).await
    }

    pub fn search_voices(&self, messages: &[String], max: usize) -> Vec<VoiceCandidate> {
        find_voice_candidates(messages, &self.voices.snapshot(), max)
    }

    /// Negotiates a plan and generates it in one go. Replies are only
    /// needed during negotiation.
    pub async fn extract(
        &self,
        user: &str,
        reference: &str,
        mut replies: mpsc::Receiver<String>,
        sink: &dyn EventSink,
    ) -> Result<SessionOutcome, PipelineError> {
        let plan = self.begin_session(user, reference, &mut replies, sink).await?;
        drop(replies);
        Ok(self.run(plan, sink).await)
    }

    /// Opens the user's session and negotiates its work plan. On any error
    /// the session is destroyed before returning.
    pub async fn begin_session(
        &self,
        user: &str,
        reference: &str,
        replies: &mut mpsc::Receiver<String>,
        sink: &dyn EventSink,
    ) -> Result<NegotiatedPlan, PipelineError> {
        let lease = SessionLease {
            handle: self.sessions.create(user)?,
            sessions: self.sessions.clone(),
            storage: self.storage.clone(),
            folder: self.user_folder(user),
            closed: false,
        };

        let negotiated = self
            .negotiate_plan(lease.handle(), reference, replies, sink)
            .await;
        match negotiated {
            Ok(plan) => {
                log::info!(
                    "Plan for {}: {} scripts, {} audio files",
                    user,
                    plan.script_count(),
                    plan.pair_count()
                );
                sink.emit(SessionEvent::plan_ready(&plan)).await;
                Ok(NegotiatedPlan { lease, plan })
            }
            Err(PipelineError::Cancelled) => {
                log::info!("Session for {} stopped during negotiation", user);
                sink.emit(SessionEvent::Notice("Stopped all generation.".to_string()))
                    .await;
                self.finish(lease, SessionOutcome::new(SessionState::Stopped), sink)
                    .await;
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                log::warn!("Session for {} failed during negotiation: {}", user, e);
                sink.emit(SessionEvent::Notice(format!("Error: {}", e))).await;
                self.finish(lease, SessionOutcome::new(SessionState::Failed), sink)
                    .await;
                Err(e)
            }
        }
    }

    async fn negotiate_plan(
        &self,
        session: &SessionHandle,
        reference: &str,
        replies: &mut mpsc::Receiver<String>,
        sink: &dyn EventSink,
    ) -> Result<WorkPlan, PipelineError> {
        sink.emit(SessionEvent::Notice("Extracting text from document...".to_string()))
            .await;
        let text = self
            .fetcher
            .fetch_document(reference)
            .await
            .map_err(PipelineError::Fetch)?;

        let scripts = parse_scripts(&text, &self.settings.annotation_tokens);
        if scripts.is_empty() {
            return Err(PipelineError::NoScripts);
        }
        sink.emit(SessionEvent::Notice(format!("Found {} scripts", scripts.len())))
            .await;

        let negotiator =
            Negotiator::new(self.settings.negotiation_timeout, self.settings.max_attempts);
        let registry = self.voices.snapshot();
        negotiator
            .negotiate(&scripts, &registry, replies, &session.stop_token(), sink)
            .await
    }

    /// Generates every pair of the plan, then closes the session.
    pub async fn run(&self, negotiated: NegotiatedPlan, sink: &dyn EventSink) -> SessionOutcome {
        let NegotiatedPlan { lease, plan } = negotiated;
        let session = lease.handle();
        session.set_state(SessionState::Generating);

        let mut outcome = SessionOutcome::new(SessionState::Generating);
        let state = self.run_plan(session, &plan, sink, &mut outcome).await;
        outcome.state = state;

        let summary = match outcome.state {
            SessionState::Stopped => "Stopped all generation.".to_string(),
            _ => format!("All done! {} audio files delivered.", outcome.delivered.len()),
        };
        sink.emit(SessionEvent::Notice(summary)).await;

        self.finish(lease, outcome, sink).await
    }

    async fn run_plan(
        &self,
        session: &SessionHandle,
        plan: &WorkPlan,
        sink: &dyn EventSink,
        outcome: &mut SessionOutcome,
    ) -> SessionState {
        for entry in plan.entries() {
            if session.is_stopped() {
                return SessionState::Stopped;
            }
            session.reset_skip();
            session.set_current(Some(entry.script));
            log::info!("Processing script #{}", entry.script);

            for (slot, voice) in entry.voices.iter().enumerate() {
                match session.interrupt() {
                    Some(Interrupt::Stop) => return SessionState::Stopped,
                    Some(Interrupt::Skip) => {
                        log::info!("Skipping remaining voices of script #{}", entry.script);
                        outcome
                            .skipped
                            .extend(entry.voices[slot..].iter().map(|v| PairRef {
                                script: entry.script,
                                voice: v.name.clone(),
                            }));
                        sink.emit(SessionEvent::ScriptSkipped(entry.script)).await;
                        break;
                    }
                    None => {}
                }

                let pair = PairRef {
                    script: entry.script,
                    voice: voice.name.clone(),
                };
                let filename = unique_filename(
                    &artifact_filename(entry.script, &voice.name, self.stitcher.extension()),
                    &outcome.delivered,
                );
                match self
                    .process_pair(session, entry, slot, voice, &filename, sink)
                    .await
                {
                    PairResult::Delivered(filename) => outcome.delivered.push(filename),
                    PairResult::Interrupted(Interrupt::Stop) => {
                        sink.emit(SessionEvent::PairStopped {
                            script: pair.script,
                            voice: pair.voice,
                        })
                        .await;
                        return SessionState::Stopped;
                    }
                    PairResult::Interrupted(Interrupt::Skip) => {
                        sink.emit(SessionEvent::PairSkipped {
                            script: pair.script,
                            voice: pair.voice.clone(),
                        })
                        .await;
                        outcome.skipped.push(pair);
                    }
                    PairResult::Failed(e) => {
                        log::warn!(
                            "Script #{} with voice {} failed: {}",
                            pair.script,
                            pair.voice,
                            e
                        );
                        sink.emit(SessionEvent::PairFailed {
                            script: pair.script,
                            voice: pair.voice.clone(),
                            error: e.to_string(),
                        })
                        .await;
                        outcome.failed.push(pair);
                    }
                }
            }
        }

        // A stop that arrives after the last pair has nothing left to stop.
        session.set_current(None);
        SessionState::Completed
    }

    async fn process_pair(
        &self,
        session: &SessionHandle,
        entry: &PlanEntry,
        slot: usize,
        voice: &VoiceProfile,
        filename: &str,
        sink: &dyn EventSink,
    ) -> PairResult {
        let paragraphs = segment(&entry.text, self.settings.limits);
        let total = paragraphs.len();
        sink.emit(SessionEvent::PairStarted {
            script: entry.script,
            voice: voice.name.clone(),
            paragraphs: total,
        })
        .await;

        let ext = self.stitcher.extension();
        let prefix = format!("s{}_v{}", entry.script, slot);
        let stop = session.stop_token();
        let mut temp: Vec<ArtifactHandle> = Vec::with_capacity(total + 1);
        let mut batch = self.pool.batch(session.tasks().clone());
        let mut progress = Progress::new(total);
        let mut interrupted = None;

        for paragraph in &paragraphs {
            // Report finished paragraphs while waiting for a free worker.
            let reserved = loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break None,
                    Some(output) = batch.next_completed(), if batch.in_flight() > 0 => {
                        progress.record(output, sink).await;
                    }
                    reserved = self.pool.reserve() => break Some(reserved),
                }
            };
            let reserved = match reserved {
                Some(Ok(reserved)) => reserved,
                Some(Err(source)) => {
                    // Nothing else can be dispatched; finish what is running.
                    for output in batch.drain().await {
                        progress.record(output, sink).await;
                    }
                    self.release(session, &temp).await;
                    return PairResult::Failed(
                        SynthesisError {
                            index: paragraph.index,
                            source,
                        }
                        .into(),
                    );
                }
                None => {
                    interrupted = Some(Interrupt::Stop);
                    break;
                }
            };
            if let Some(kind) = session.interrupt() {
                interrupted = Some(kind);
                break;
            }

            let name = format!("{}_p{:04}.{}", prefix, paragraph.index, ext);
            let target = self.temp_handle(session.user(), &name);
            session.own(target.clone());
            temp.push(target.clone());
            log::debug!(
                "Dispatching paragraph {}/{} ({} words)",
                paragraph.index + 1,
                total,
                paragraph.words
            );
            batch.dispatch(
                reserved,
                SynthesisJob {
                    index: paragraph.index,
                    text: paragraph.text.clone(),
                    voice_id: voice.backend_id.clone(),
                    target,
                },
            );
        }
        if let Some(kind) = interrupted {
            log::info!(
                "{:?} observed after {} of {} paragraphs",
                kind,
                batch.submitted(),
                total
            );
        }

        while let Some(output) = batch.next_completed().await {
            progress.record(output, sink).await;
        }

        if let Some(kind) = interrupted.or_else(|| session.interrupt()) {
            self.release(session, &temp).await;
            return PairResult::Interrupted(kind);
        }

        let segments = match reassemble(progress.outputs) {
            Ok(segments) => segments,
            Err(e) => {
                self.release(session, &temp).await;
                return PairResult::Failed(e.into());
            }
        };

        let output = self.temp_handle(session.user(), &format!("{}.{}", prefix, ext));
        session.own(output.clone());
        temp.push(output.clone());

        let result = self
            .deliver(entry.script, voice, &segments, &output, filename, sink)
            .await;
        self.release(session, &temp).await;
        match result {
            Ok(()) => PairResult::Delivered(filename.to_string()),
            Err(e) => PairResult::Failed(e),
        }
    }

    async fn deliver(
        &self,
        script: ScriptKey,
        voice: &VoiceProfile,
        segments: &[AudioSegment],
        output: &ArtifactHandle,
        filename: &str,
        sink: &dyn EventSink,
    ) -> Result<(), PipelineError> {
        let artifact = self.stitcher.stitch(script, segments, output).await?;
        let bytes = self
            .storage
            .read(&artifact.handle)
            .await
            .map_err(PipelineError::Storage)?;
        log::info!("Delivering {} ({} bytes)", filename, artifact.size);

        sink.emit(SessionEvent::PairCompleted {
            script,
            voice: voice.name.clone(),
            artifact: DeliveredArtifact {
                filename: filename.to_string(),
                bytes,
            },
        })
        .await;
        Ok(())
    }

    fn user_folder(&self, user: &str) -> String {
        let safe: String = user
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Path::new(&self.settings.work_folder)
            .join(safe)
            .to_string_lossy()
            .to_string()
    }

    fn temp_handle(&self, user: &str, name: &str) -> ArtifactHandle {
        Path::new(&self.user_folder(user))
            .join(name)
            .to_string_lossy()
            .to_string()
    }

    async fn release(&self, session: &SessionHandle, handles: &[ArtifactHandle]) {
        for handle in handles {
            if let Err(e) = self.storage.delete(handle).await {
                log::warn!("Failed to delete temporary file {}: {:#}", handle, e);
            }
            session.disown(handle);
        }
    }

    /// Terminal transition: waits for the session's synthesis tasks,
    /// releases whatever it still owns and removes it from the store.
    async fn finish(
        &self,
        mut lease: SessionLease,
        outcome: SessionOutcome,
        sink: &dyn EventSink,
    ) -> SessionOutcome {
        let session = lease.handle.clone();
        session.tasks().close();
        session.tasks().wait().await;

        let leftovers = session.take_owned();
        if !leftovers.is_empty() {
            log::debug!("Releasing {} leftover artifacts", leftovers.len());
        }
        self.release(&session, &leftovers).await;

        if let Err(e) = self.storage.delete(&lease.folder).await {
            log::warn!("Failed to clean up {}: {:#}", lease.folder, e);
        }

        session.set_current(None);
        session.set_state(outcome.state);
        self.sessions.remove(&session);
        lease.closed = true;
        log::info!(
            "Session for {} finished: {:?} ({} delivered, {} skipped, {} failed)",
            session.user(),
            outcome.state,
            outcome.delivered.len(),
            outcome.skipped.len(),
            outcome.failed.len()
        );
        sink.emit(SessionEvent::Finished(outcome.clone())).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::voices::JsonVoiceStore;
    use crate::services::tts::TtsBackend;
    use crate::utils::audio::{AudioCodec, DecodedSegment, Mp3Codec};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    struct FixedDocument(String);

    #[async_trait]
    impl DocumentFetcher for FixedDocument {
        async fn fetch_document(&self, _reference: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDocument;

    #[async_trait]
    impl DocumentFetcher for BrokenDocument {
        async fn fetch_document(&self, _reference: &str) -> Result<String> {
            anyhow::bail!("404 Not Found")
        }
    }

    /// Returns `"<text>|"`. The first call is slow so completion order
    /// differs from submission order. Voice id `bad` always fails.
    #[derive(Default)]
    struct MockTtsBackend {
        calls: Mutex<Vec<(String, String)>>,
        started: AtomicUsize,
    }

    #[async_trait]
    impl TtsBackend for MockTtsBackend {
        async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .push((text.to_string(), voice_id.to_string()));
            if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if voice_id == "bad" {
                anyhow::bail!("voice not found");
            }
            Ok(format!("{}|", text).into_bytes())
        }
    }

    /// Blocks every call until the test adds a permit to `gate`.
    struct GatedBackend {
        entered: mpsc::UnboundedSender<String>,
        gate: Semaphore,
    }

    impl GatedBackend {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (entered, rx) = mpsc::unbounded_channel();
            let backend = Arc::new(Self {
                entered,
                gate: Semaphore::new(0),
            });
            (backend, rx)
        }
    }

    #[async_trait]
    impl TtsBackend for GatedBackend {
        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>> {
            let _ = self.entered.send(text.to_string());
            self.gate.acquire().await?.forget();
            Ok(text.as_bytes().to_vec())
        }
    }

    #[derive(Default)]
    struct CountingCodec {
        concatenations: AtomicUsize,
    }

    impl AudioCodec for CountingCodec {
        fn extension(&self) -> &'static str {
            "mp3"
        }
        fn decode(&self, bytes: Vec<u8>) -> Result<DecodedSegment> {
            Mp3Codec.decode(bytes)
        }
        fn concatenate(&self, segments: &[DecodedSegment]) -> Result<Vec<u8>> {
            self.concatenations.fetch_add(1, Ordering::SeqCst);
            Mp3Codec.concatenate(segments)
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl CollectingSink {
        fn delivered(&self) -> Vec<(String, Vec<u8>)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::PairCompleted { artifact, .. } => {
                        Some((artifact.filename.clone(), artifact.bytes.clone()))
                    }
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn emit(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Sends `action` for `user` the first time `trigger` matches an event,
    /// the way a user typing `!stop` or `!skip` at that moment would.
    struct SignalOn {
        store: Arc<SessionStore>,
        user: String,
        action: Interrupt,
        trigger: fn(&SessionEvent) -> bool,
        fired: AtomicBool,
        inner: CollectingSink,
    }

    impl SignalOn {
        fn new(
            manager: &SessionManager,
            action: Interrupt,
            trigger: fn(&SessionEvent) -> bool,
        ) -> Self {
            Self {
                store: manager.sessions(),
                user: "alice".to_string(),
                action,
                trigger,
                fired: AtomicBool::new(false),
                inner: CollectingSink::default(),
            }
        }
    }

    #[async_trait]
    impl EventSink for SignalOn {
        async fn emit(&self, event: SessionEvent) {
            if (self.trigger)(&event) && !self.fired.swap(true, Ordering::SeqCst) {
                match self.action {
                    Interrupt::Stop => self.store.signal_stop(&self.user).unwrap(),
                    Interrupt::Skip => {
                        self.store.signal_skip(&self.user).unwrap();
                    }
                }
            }
            self.inner.emit(event).await;
        }
    }

    fn settings(work: &Path, hard_cap: usize) -> SessionSettings {
        SessionSettings {
            work_folder: work.to_string_lossy().to_string(),
            limits: SegmentLimits {
                target_words: hard_cap,
                hard_cap,
            },
            annotation_tokens: vec!["INSPO".to_string()],
            negotiation_timeout: Duration::from_secs(5),
            max_attempts: 1,
        }
    }

    async fn manager(
        root: &Path,
        settings: SessionSettings,
        fetcher: Arc<dyn DocumentFetcher>,
        backend: Arc<dyn TtsBackend>,
        codec: Arc<dyn AudioCodec>,
        workers: usize,
    ) -> SessionManager {
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        let voices = Arc::new(
            VoiceLibrary::load(Box::new(JsonVoiceStore::new(root.join("voices.json")))).await,
        );
        SessionManager::new(
            settings,
            voices,
            fetcher,
            SynthesisPool::new(backend, storage.clone(), workers),
            Stitcher::new(codec, storage.clone()),
            storage,
        )
    }

    fn document(text: &str) -> Arc<dyn DocumentFetcher> {
        Arc::new(FixedDocument(text.to_string()))
    }

    async fn replies(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.send(line.to_string()).await.unwrap();
        }
        rx
    }

    fn work_is_empty(work: &Path) -> bool {
        std::fs::read_dir(work)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    async fn wait_until_closed(manager: &SessionManager, user: &str) {
        for _ in 0..200 {
            if manager.sessions().get(user).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session for {} was never closed", user);
    }

    const TWO_SCRIPTS: &str = "Script #1 INSPO\nHello there.\n\
        Script #2\nAlpha beta gamma. Delta epsilon zeta eta. Theta iota.";

    #[tokio::test]
    async fn test_end_to_end_delivers_each_pair_in_paragraph_order() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let backend = Arc::new(MockTtsBackend::default());
        let manager = manager(
            temp_dir.path(),
            settings(&work, 4),
            document(TWO_SCRIPTS),
            backend.clone(),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = CollectingSink::default();

        let outcome = manager
            .extract("alice", "doc", replies(&["all", "1", "1,2"]).await, &sink)
            .await?;

        assert_eq!(outcome.state, SessionState::Completed);
        let delivered = sink.delivered();
        let names: Vec<&str> = delivered.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["script_1_James.mp3", "script_2_James.mp3", "script_2_Melissa.mp3"]
        );
        assert_eq!(delivered[0].1, b"Hello there|");
        let expected = b"Alpha beta gamma|Delta epsilon zeta eta|Theta iota|";
        assert_eq!(delivered[1].1, expected);
        assert_eq!(delivered[2].1, expected);

        let melissa_calls = backend
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id)| id == "27ximz35zKCDKjbjZGNt")
            .count();
        assert_eq!(melissa_calls, 3);

        assert_eq!(
            sink.count(|e| matches!(e, SessionEvent::ParagraphSynthesized { .. })),
            7
        );
        assert!(work_is_empty(&work));
        assert!(manager.sessions().get("alice").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_extract_runs_on_a_spawned_task() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let manager = Arc::new(
            manager(
                temp_dir.path(),
                settings(&work, 4),
                document(TWO_SCRIPTS),
                Arc::new(MockTtsBackend::default()),
                Arc::new(Mp3Codec),
                2,
            )
            .await,
        );
        let sink = Arc::new(CollectingSink::default());
        let rx = replies(&["2", "3"]).await;

        let task = {
            let manager = manager.clone();
            let sink = sink.clone();
            tokio::spawn(async move { manager.extract("alice", "doc", rx, sink.as_ref()).await })
        };
        let outcome = task.await??;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.delivered, vec!["script_2_Default.mp3"]);
        assert!(work_is_empty(&work));
        Ok(())
    }

    #[tokio::test]
    async fn test_progress_is_reported_while_later_paragraphs_wait() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let (backend, mut entered) = GatedBackend::new();
        let manager = Arc::new(
            manager(
                temp_dir.path(),
                settings(&work, 2),
                document("Script #1 a b. c d. e f."),
                backend.clone(),
                Arc::new(Mp3Codec),
                1,
            )
            .await,
        );
        let sink = Arc::new(CollectingSink::default());
        let rx = replies(&["1", "1"]).await;

        let task = {
            let manager = manager.clone();
            let sink = sink.clone();
            tokio::spawn(async move { manager.extract("alice", "doc", rx, sink.as_ref()).await })
        };

        assert_eq!(entered.recv().await.as_deref(), Some("a b"));
        backend.gate.add_permits(1);
        assert_eq!(entered.recv().await.as_deref(), Some("c d"));
        assert_eq!(
            sink.count(|e| matches!(e, SessionEvent::ParagraphSynthesized { done: 1, total: 3 })),
            1,
            "first paragraph reported before the last one is dispatched"
        );

        backend.gate.add_permits(2);
        let outcome = task.await??;
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(
            sink.count(|e| matches!(e, SessionEvent::ParagraphSynthesized { .. })),
            3
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_after_two_paragraphs_never_stitches() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let (backend, mut entered) = GatedBackend::new();
        let codec = Arc::new(CountingCodec::default());
        let manager = Arc::new(
            manager(
                temp_dir.path(),
                settings(&work, 2),
                document("Script #1 a b. c d. e f. g h. i j."),
                backend.clone(),
                codec.clone(),
                1,
            )
            .await,
        );
        let sink = Arc::new(CollectingSink::default());

        let mut rx = replies(&["1", "3"]).await;
        let plan = manager
            .begin_session("alice", "doc", &mut rx, sink.as_ref())
            .await?;
        assert_eq!(plan.user(), "alice");
        assert_eq!(plan.plan().pair_count(), 1);

        let runner = {
            let manager = manager.clone();
            let sink = sink.clone();
            tokio::spawn(async move { manager.run(plan, sink.as_ref()).await })
        };

        assert_eq!(entered.recv().await.as_deref(), Some("a b"));
        backend.gate.add_permits(1);
        assert_eq!(entered.recv().await.as_deref(), Some("c d"));
        manager.signal_stop("alice")?;
        backend.gate.add_permits(1);

        let outcome = runner.await?;
        assert_eq!(outcome.state, SessionState::Stopped);
        assert!(outcome.delivered.is_empty());
        assert!(entered.try_recv().is_err(), "no paragraph after the stop");
        assert_eq!(codec.concatenations.load(Ordering::SeqCst), 0);
        assert_eq!(sink.count(|e| matches!(e, SessionEvent::PairStopped { .. })), 1);
        assert!(sink.delivered().is_empty());
        assert!(work_is_empty(&work));
        assert!(manager.signal_stop("alice").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_extract_releases_the_session() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let (backend, mut entered) = GatedBackend::new();
        let manager = Arc::new(
            manager(
                temp_dir.path(),
                settings(&work, 2),
                document("Script #1 a b. c d. e f."),
                backend.clone(),
                Arc::new(Mp3Codec),
                1,
            )
            .await,
        );
        let sink = Arc::new(CollectingSink::default());
        let rx = replies(&["1", "1"]).await;

        let task = {
            let manager = manager.clone();
            let sink = sink.clone();
            tokio::spawn(async move { manager.extract("alice", "doc", rx, sink.as_ref()).await })
        };
        assert_eq!(entered.recv().await.as_deref(), Some("a b"));
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // The orphaned job finishes and writes its segment; cleanup runs after it.
        backend.gate.add_permits(100);
        wait_until_closed(&manager, "alice").await;
        assert!(work_is_empty(&work));
        assert!(entered.try_recv().is_err(), "nothing dispatched after the abort");

        let outcome = manager
            .extract("alice", "doc", replies(&["1", "1"]).await, sink.as_ref())
            .await?;
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.delivered, vec!["script_1_James.mp3"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unused_plan_releases_the_session() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let manager = manager(
            temp_dir.path(),
            settings(&temp_dir.path().join("build"), 60),
            document(TWO_SCRIPTS),
            Arc::new(MockTtsBackend::default()),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = CollectingSink::default();

        let mut rx = replies(&["1", "1"]).await;
        let plan = manager.begin_session("alice", "doc", &mut rx, &sink).await?;
        assert!(manager.sessions().get("alice").is_some());
        drop(plan);

        wait_until_closed(&manager, "alice").await;
        let mut rx = replies(&["1", "2"]).await;
        assert!(manager.begin_session("alice", "doc", &mut rx, &sink).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_between_voices_moves_to_next_script() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let backend = Arc::new(MockTtsBackend::default());
        let manager = manager(
            temp_dir.path(),
            settings(&work, 60),
            document("Script #1 Hello there. Script #2 General Kenobi."),
            backend.clone(),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = SignalOn::new(&manager, Interrupt::Skip, |e| {
            matches!(e, SessionEvent::PairCompleted { .. })
        });

        let outcome = manager
            .extract("alice", "doc", replies(&["all", "1,2,3", "2"]).await, &sink)
            .await?;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.delivered, vec!["script_1_James.mp3", "script_2_Melissa.mp3"]);
        let skipped: Vec<&str> = outcome.skipped.iter().map(|p| p.voice.as_str()).collect();
        assert_eq!(skipped, vec!["Melissa", "Default"]);
        assert_eq!(
            sink.inner
                .count(|e| matches!(e, SessionEvent::ScriptSkipped(1))),
            1
        );

        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("Hello there".to_string(), "ztnpYzQJyWffPj1VC5Uw".to_string()),
                ("General Kenobi".to_string(), "27ximz35zKCDKjbjZGNt".to_string()),
            ]
        );
        assert!(work_is_empty(&work));
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_mid_pair_drops_the_rest_of_the_script() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let (backend, mut entered) = GatedBackend::new();
        let codec = Arc::new(CountingCodec::default());
        let manager = Arc::new(
            manager(
                temp_dir.path(),
                settings(&work, 2),
                document("Script #1 a b. c d. Script #2 e f."),
                backend.clone(),
                codec.clone(),
                1,
            )
            .await,
        );
        let sink = Arc::new(CollectingSink::default());
        let rx = replies(&["all", "1,2,3", "2"]).await;

        let task = {
            let manager = manager.clone();
            let sink = sink.clone();
            tokio::spawn(async move { manager.extract("alice", "doc", rx, sink.as_ref()).await })
        };

        assert_eq!(entered.recv().await.as_deref(), Some("a b"));
        assert_eq!(manager.signal_skip("alice")?, Some(1));
        backend.gate.add_permits(1);
        assert_eq!(entered.recv().await.as_deref(), Some("e f"));
        backend.gate.add_permits(1);

        let outcome = task.await??;
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.delivered, vec!["script_2_Melissa.mp3"]);
        assert_eq!(
            outcome.skipped,
            ["James", "Melissa", "Default"]
                .iter()
                .map(|voice| PairRef {
                    script: 1,
                    voice: voice.to_string()
                })
                .collect::<Vec<_>>()
        );
        let james_skipped = sink.count(|e| {
            matches!(e, SessionEvent::PairSkipped { script: 1, voice } if voice == "James")
        });
        assert_eq!(james_skipped, 1);
        assert_eq!(sink.count(|e| matches!(e, SessionEvent::ScriptSkipped(1))), 1);
        assert_eq!(codec.concatenations.load(Ordering::SeqCst), 1);
        assert!(work_is_empty(&work));
        Ok(())
    }

    #[tokio::test]
    async fn test_synthesis_error_aborts_only_the_pair() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let codec = Arc::new(CountingCodec::default());
        let manager = manager(
            temp_dir.path(),
            settings(&work, 2),
            document("Script #1 a b. c d. e f."),
            Arc::new(MockTtsBackend::default()),
            codec.clone(),
            2,
        )
        .await;
        let sink = CollectingSink::default();

        let outcome = manager
            .extract("alice", "doc", replies(&["1", "bad, 2"]).await, &sink)
            .await?;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(
            outcome.failed,
            vec![PairRef {
                script: 1,
                voice: "Custom".to_string()
            }]
        );
        assert_eq!(outcome.delivered, vec!["script_1_Melissa.mp3"]);
        assert_eq!(codec.concatenations.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(|e| matches!(e, SessionEvent::PairFailed { .. })), 1);
        assert!(work_is_empty(&work));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_after_a_failed_pair_ends_the_session() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let work = temp_dir.path().join("build");
        let backend = Arc::new(MockTtsBackend::default());
        let manager = manager(
            temp_dir.path(),
            settings(&work, 2),
            document("Script #1 a b. c d."),
            backend.clone(),
            Arc::new(Mp3Codec),
            2,
        )
        .await;
        let sink = SignalOn::new(&manager, Interrupt::Stop, |e| {
            matches!(e, SessionEvent::PairFailed { .. })
        });

        let outcome = manager
            .extract("alice", "doc", replies(&["1", "bad, 2"]).await, &sink)
            .await?;

        assert_eq!(outcome.state, SessionState::Stopped);
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.delivered.is_empty());
        assert!(backend
            .calls
            .lock()
            .unwrap()
            .iter()
            .all(|(_, id)| id == "bad"));
        assert_eq!(sink.inner.count(|e| matches!(e, SessionEvent::PairStopped { .. })), 0);
        assert!(work_is_empty(&work));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_after_last_delivery_still_completes() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let manager = manager(
            temp_dir.path(),
            settings(&temp_dir.path().join("build"), 60),
            document(TWO_SCRIPTS),
            Arc::new(MockTtsBackend::default()),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = SignalOn::new(&manager, Interrupt::Stop, |e| {
            matches!(e, SessionEvent::PairCompleted { .. })
        });

        let outcome = manager
            .extract("alice", "doc", replies(&["1", "2"]).await, &sink)
            .await?;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.delivered, vec!["script_1_Melissa.mp3"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_raw_voice_ids_get_distinct_filenames() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let manager = manager(
            temp_dir.path(),
            settings(&temp_dir.path().join("build"), 60),
            document(TWO_SCRIPTS),
            Arc::new(MockTtsBackend::default()),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = CollectingSink::default();

        let outcome = manager
            .extract(
                "alice",
                "doc",
                replies(&["2", "AbCdEfGhIjKlMnOpQrSt, ZyXwVuTsRqPoNmLkJiHg"]).await,
                &sink,
            )
            .await?;

        assert_eq!(
            outcome.delivered,
            vec!["script_2_Custom.mp3", "script_2_Custom_2.mp3"]
        );
        let names: Vec<String> = sink.delivered().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, outcome.delivered);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_during_negotiation() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let backend = Arc::new(MockTtsBackend::default());
        let manager = manager(
            temp_dir.path(),
            settings(&temp_dir.path().join("build"), 60),
            document(TWO_SCRIPTS),
            backend.clone(),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = SignalOn::new(&manager, Interrupt::Stop, |e| {
            matches!(e, SessionEvent::Prompt(_))
        });
        let (_tx, rx) = mpsc::channel::<String>(1);

        let err = manager.extract("alice", "doc", rx, &sink).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(manager.sessions().get("alice").is_none());
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(
            sink.inner.count(|e| matches!(
                e,
                SessionEvent::Finished(SessionOutcome {
                    state: SessionState::Stopped,
                    ..
                })
            )),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_second_session_for_same_user_is_rejected() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let manager = manager(
            temp_dir.path(),
            settings(&temp_dir.path().join("build"), 60),
            document(TWO_SCRIPTS),
            Arc::new(MockTtsBackend::default()),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let existing = manager.sessions().create("alice")?;
        let sink = CollectingSink::default();

        let err = manager
            .extract("alice", "doc", replies(&["all"]).await, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SessionBusy(_)));

        let current = manager.sessions().get("alice").unwrap();
        assert!(Arc::ptr_eq(&existing, &current));
        assert_eq!(current.state(), SessionState::Negotiating);
        Ok(())
    }

    #[tokio::test]
    async fn test_negotiation_timeout_discards_session() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut settings = settings(&temp_dir.path().join("build"), 60);
        settings.negotiation_timeout = Duration::from_millis(20);
        let backend = Arc::new(MockTtsBackend::default());
        let manager = manager(
            temp_dir.path(),
            settings,
            document(TWO_SCRIPTS),
            backend.clone(),
            Arc::new(Mp3Codec),
            3,
        )
        .await;
        let sink = CollectingSink::default();
        let (_tx, mut rx) = mpsc::channel::<String>(1);

        let err = manager
            .begin_session("alice", "doc", &mut rx, &sink)
            .await
            .err()
            .expect("negotiation must time out");
        assert!(matches!(err, PipelineError::NegotiationTimeout { .. }));
        assert!(manager.sessions().get("alice").is_none());
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(
            sink.count(|e| matches!(
                e,
                SessionEvent::Finished(SessionOutcome {
                    state: SessionState::Failed,
                    ..
                })
            )),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_negotiation_errors() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let build = temp_dir.path().join("build");
        let sink = CollectingSink::default();
        let cases: Vec<(Arc<dyn DocumentFetcher>, Vec<&str>)> = vec![
            (document(TWO_SCRIPTS), vec!["1,9"]),
            (document("no headers here"), vec![]),
            (Arc::new(BrokenDocument) as Arc<dyn DocumentFetcher>, vec![]),
        ];

        let mut errors = Vec::new();
        for (fetcher, lines) in cases {
            let manager = manager(
                temp_dir.path(),
                settings(&build, 60),
                fetcher,
                Arc::new(MockTtsBackend::default()),
                Arc::new(Mp3Codec),
                3,
            )
            .await;
            let err = manager
                .extract("alice", "doc", replies(&lines).await, &sink)
                .await
                .unwrap_err();
            assert!(manager.sessions().get("alice").is_none());
            errors.push(err);
        }

        assert!(matches!(errors[0], PipelineError::InvalidSelection(_)));
        assert!(matches!(errors[1], PipelineError::NoScripts));
        assert!(matches!(errors[2], PipelineError::Fetch(_)));
        assert!(work_is_empty(&build));
        Ok(())
    }
}
