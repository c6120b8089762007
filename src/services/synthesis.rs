//! Bounded fan-out of paragraph synthesis calls.
//!
//! The pool is a plain concurrent map from paragraph to stored segment. It
//! never retries and never looks at cancellation; callers decide whether to
//! keep dispatching and always drain what they started.

use anyhow::anyhow;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;

use crate::core::error::SynthesisError;
use crate::core::io::{ArtifactHandle, Storage};
use crate::core::state::AudioSegment;
use crate::services::tts::TtsBackend;

#[derive(Debug, Clone)]
pub struct SynthesisJob {
    pub index: usize,
    pub text: String,
    pub voice_id: String,
    /// Where the synthesized audio is written.
    pub target: ArtifactHandle,
}

#[derive(Debug)]
pub struct SynthesisOutput {
    pub index: usize,
    pub result: Result<AudioSegment, SynthesisError>,
}

/// A reserved worker. Holding one guarantees the next dispatch starts
/// immediately.
pub struct Slot(OwnedSemaphorePermit);

#[derive(Clone)]
pub struct SynthesisPool {
    backend: Arc<dyn TtsBackend>,
    storage: Arc<dyn Storage>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl SynthesisPool {
    pub fn new(backend: Arc<dyn TtsBackend>, storage: Arc<dyn Storage>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            backend,
            storage,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Waits for a free worker. Permits are shared across all sessions using
    /// the same pool.
    pub async fn reserve(&self) -> anyhow::Result<Slot> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("synthesis pool is closed"))?;
        Ok(Slot(permit))
    }

    /// Starts a batch whose jobs are spawned on `tracker`.
    pub fn batch(&self, tracker: TaskTracker) -> SynthesisBatch {
        SynthesisBatch {
            pool: self.clone(),
            tracker,
            running: FuturesUnordered::new(),
            submitted: 0,
        }
    }
}

/// Jobs submitted for one (script, voice) pair.
pub struct SynthesisBatch {
    pool: SynthesisPool,
    tracker: TaskTracker,
    running: FuturesUnordered<BoxFuture<'static, SynthesisOutput>>,
    submitted: usize,
}

impl SynthesisBatch {
    pub fn dispatch(&mut self, slot: Slot, job: SynthesisJob) {
        let index = job.index;
        let backend = self.pool.backend.clone();
        let storage = self.pool.storage.clone();

        let task = self.tracker.spawn(async move {
            let _permit = slot;
            let audio = backend.synthesize(&job.text, &job.voice_id).await?;
            storage.write(&job.target, &audio).await?;
            log::debug!("Paragraph {} synthesized ({} bytes)", job.index + 1, audio.len());
            Ok::<_, anyhow::Error>(AudioSegment {
                index: job.index,
                handle: job.target,
            })
        });

        self.running.push(
            async move {
                let result = match task.await {
                    Ok(res) => res,
                    Err(e) => Err(anyhow!("synthesis task aborted: {}", e)),
                };
                SynthesisOutput {
                    index,
                    result: result.map_err(|source| SynthesisError { index, source }),
                }
            }
            .boxed(),
        );
        self.submitted += 1;
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Next finished job in completion order, `None` once everything
    /// submitted has finished.
    pub async fn next_completed(&mut self) -> Option<SynthesisOutput> {
        self.running.next().await
    }

    pub async fn drain(&mut self) -> Vec<SynthesisOutput> {
        let mut outputs = Vec::with_capacity(self.running.len());
        while let Some(output) = self.next_completed().await {
            outputs.push(output);
        }
        outputs
    }
}

/// Puts segments back in paragraph order. Any failure fails the whole set,
/// reported as the lowest failing index.
pub fn reassemble(mut outputs: Vec<SynthesisOutput>) -> Result<Vec<AudioSegment>, SynthesisError> {
    outputs.sort_by_key(|o| o.index);

    let mut segments = Vec::with_capacity(outputs.len());
    let mut first_error = None;
    for output in outputs {
        match output.result {
            Ok(segment) => segments.push(segment),
            Err(e) => {
                log::warn!("{}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(segments),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replies `"<text>"` after a delay that shrinks with the paragraph
    /// number, so later paragraphs finish first.
    struct SlowFirstBackend {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TtsBackend for SlowFirstBackend {
        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let n: u64 = text.trim_start_matches('p').parse()?;
            tokio::time::sleep(Duration::from_millis(60 - n * 10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if text == "p3" {
                anyhow::bail!("quota exceeded");
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    fn job(dir: &std::path::Path, index: usize) -> SynthesisJob {
        SynthesisJob {
            index,
            text: format!("p{}", index),
            voice_id: "voice".to_string(),
            target: dir
                .join(format!("p_{:04}.mp3", index))
                .to_string_lossy()
                .to_string(),
        }
    }

    #[tokio::test]
    async fn test_results_reassemble_by_index_not_arrival() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let backend = Arc::new(SlowFirstBackend {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let storage = Arc::new(NativeStorage::new());
        let pool = SynthesisPool::new(backend.clone(), storage.clone(), 2);

        let mut batch = pool.batch(TaskTracker::new());
        for i in 0..3 {
            let slot = pool.reserve().await?;
            batch.dispatch(slot, job(temp_dir.path(), i));
        }
        assert_eq!(batch.submitted(), 3);
        assert_eq!(batch.in_flight(), 3);

        let mut arrival = Vec::new();
        let mut outputs = Vec::new();
        while let Some(output) = batch.next_completed().await {
            arrival.push(output.index);
            outputs.push(output);
        }
        assert_ne!(arrival, vec![0, 1, 2], "completion order should be scrambled");
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);

        let segments = reassemble(outputs).map_err(|e| anyhow!("{}", e))?;
        let indices: Vec<usize> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(storage.read(&segments[0].handle).await?, b"p0");
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_tagged_and_siblings_finish() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let backend = Arc::new(SlowFirstBackend {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let storage = Arc::new(NativeStorage::new());
        let pool = SynthesisPool::new(backend, storage.clone(), 3);

        let tracker = TaskTracker::new();
        let mut batch = pool.batch(tracker.clone());
        for i in 1..5 {
            let slot = pool.reserve().await?;
            batch.dispatch(slot, job(temp_dir.path(), i));
        }
        let outputs = batch.drain().await;
        assert_eq!(outputs.len(), 4);
        assert_eq!(batch.in_flight(), 0);

        // Paragraph 4 still completed even though 3 failed.
        assert!(std::path::Path::new(&job(temp_dir.path(), 4).target).exists());

        tracker.close();
        tracker.wait().await;

        let err = reassemble(outputs).unwrap_err();
        assert_eq!(err.index, 3);
        assert!(err.to_string().contains("quota exceeded"));
        Ok(())
    }

    #[test]
    fn test_pool_has_at_least_one_worker() {
        let backend = Arc::new(SlowFirstBackend {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = SynthesisPool::new(backend, Arc::new(NativeStorage::new()), 0);
        assert_eq!(pool.workers(), 1);
    }

    #[tokio::test]
    async fn test_reserve_waits_for_a_released_slot() -> Result<()> {
        let backend = Arc::new(SlowFirstBackend {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = SynthesisPool::new(backend, Arc::new(NativeStorage::new()), 1);

        let held = pool.reserve().await?;
        let waiting = tokio::time::timeout(Duration::from_millis(20), pool.reserve()).await;
        assert!(waiting.is_err(), "second reservation must wait");

        drop(held);
        let _slot = tokio::time::timeout(Duration::from_secs(1), pool.reserve()).await??;
        Ok(())
    }
}
