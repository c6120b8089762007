use std::sync::Arc;

use crate::core::error::PipelineError;
use crate::core::io::{ArtifactHandle, Storage};
use crate::core::script::ScriptKey;
use crate::core::state::{AudioSegment, OutputArtifact};
use crate::utils::audio::AudioCodec;

/// Joins ordered audio segments into one output artifact.
pub struct Stitcher {
    codec: Arc<dyn AudioCodec>,
    storage: Arc<dyn Storage>,
}

impl Stitcher {
    pub fn new(codec: Arc<dyn AudioCodec>, storage: Arc<dyn Storage>) -> Self {
        Self { codec, storage }
    }

    pub fn extension(&self) -> &'static str {
        self.codec.extension()
    }

    /// Concatenates `segments` in the order given. Callers are responsible
    /// for sorting by paragraph index.
    pub async fn stitch(
        &self,
        script: ScriptKey,
        segments: &[AudioSegment],
        output: &ArtifactHandle,
    ) -> Result<OutputArtifact, PipelineError> {
        if segments.is_empty() {
            return Err(PipelineError::EmptyInput(script));
        }

        let mut decoded = Vec::with_capacity(segments.len());
        for segment in segments {
            let bytes = self
                .storage
                .read(&segment.handle)
                .await
                .map_err(PipelineError::Storage)?;
            let part = self.codec.decode(bytes).map_err(|e| {
                PipelineError::Codec(e.context(format!("paragraph {}", segment.index + 1)))
            })?;
            decoded.push(part);
        }

        let merged = self.codec.concatenate(&decoded).map_err(PipelineError::Codec)?;
        self.storage
            .write(output, &merged)
            .await
            .map_err(PipelineError::Storage)?;

        log::info!(
            "Stitched {} segments for script #{} into {} ({} bytes)",
            segments.len(),
            script,
            output,
            merged.len()
        );
        Ok(OutputArtifact {
            handle: output.clone(),
            size: merged.len(),
        })
    }
}
