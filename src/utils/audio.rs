use anyhow::{anyhow, Context, Result};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// One decoded audio segment ready for concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSegment {
    /// Stream format descriptor; segments must agree on it to be joined.
    pub format: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

pub trait AudioCodec: Send + Sync {
    fn extension(&self) -> &'static str;
    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedSegment>;
    fn concatenate(&self, segments: &[DecodedSegment]) -> Result<Vec<u8>>;
}

pub fn create_codec(format: &str) -> Result<Arc<dyn AudioCodec>> {
    match format.to_ascii_lowercase().as_str() {
        "mp3" => Ok(Arc::new(Mp3Codec)),
        "wav" => Ok(Arc::new(WavCodec)),
        other => Err(anyhow!("Unknown audio format: {}", other)),
    }
}

/// MP3 is a frame stream, so segments join by plain byte concatenation.
pub struct Mp3Codec;

impl AudioCodec for Mp3Codec {
    fn extension(&self) -> &'static str {
        "mp3"
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedSegment> {
        if bytes.is_empty() {
            return Err(anyhow!("Empty MP3 segment"));
        }
        Ok(DecodedSegment {
            format: None,
            payload: bytes,
        })
    }

    fn concatenate(&self, segments: &[DecodedSegment]) -> Result<Vec<u8>> {
        let total = segments.iter().map(|s| s.payload.len()).sum();
        let mut out = Vec::with_capacity(total);
        for segment in segments {
            out.write_all(&segment.payload)?;
        }
        Ok(out)
    }
}

/// WAV segments are parsed and their data chunks merged under one header.
pub struct WavCodec;

struct WavInfo {
    fmt_content: Vec<u8>,
    data_offset: u64,
    data_size: u32,
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt_content: Option<Vec<u8>> = None;
    let mut data: Option<(u64, u32)> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            fmt_content = Some(buf);
        } else if &chunk_id == b"data" {
            data = Some((f.stream_position()?, chunk_size));
            break;
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64))?;
        }
    }

    let (data_offset, data_size) = data.ok_or_else(|| anyhow!("Missing data chunk"))?;
    if data_offset + data_size as u64 > bytes.len() as u64 {
        return Err(anyhow!("Truncated data chunk"));
    }

    Ok(WavInfo {
        fmt_content: fmt_content.ok_or_else(|| anyhow!("Missing fmt chunk"))?,
        data_offset,
        data_size,
    })
}

impl AudioCodec for WavCodec {
    fn extension(&self) -> &'static str {
        "wav"
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedSegment> {
        let info = scan_wav(&bytes)?;
        let start = info.data_offset as usize;
        let end = start + info.data_size as usize;
        Ok(DecodedSegment {
            format: Some(info.fmt_content),
            payload: bytes[start..end].to_vec(),
        })
    }

    fn concatenate(&self, segments: &[DecodedSegment]) -> Result<Vec<u8>> {
        let first = segments
            .first()
            .ok_or_else(|| anyhow!("No WAV segments to concatenate"))?;
        let base_fmt = first
            .format
            .as_ref()
            .ok_or_else(|| anyhow!("WAV segment without fmt chunk"))?;

        let mut total_data_size: u32 = 0;
        for (i, segment) in segments.iter().enumerate() {
            if segment.format.as_ref() != Some(base_fmt) {
                return Err(anyhow!(
                    "WAV format mismatch in segment {}. All segments must have same sample rate/channels.",
                    i + 1
                ));
            }
            let size = u32::try_from(segment.payload.len()).context("WAV segment too large")?;
            total_data_size = total_data_size
                .checked_add(size)
                .ok_or_else(|| anyhow!("Stitched WAV exceeds 4 GiB"))?;
        }

        let mut out = Vec::with_capacity(total_data_size as usize + base_fmt.len() + 20);

        // RIFF size = "WAVE" + fmt chunk + data chunk header + data
        out.write_all(b"RIFF")?;
        let chunk_size = 4 + 8 + base_fmt.len() as u32 + 8 + total_data_size;
        out.write_all(&chunk_size.to_le_bytes())?;
        out.write_all(b"WAVE")?;

        out.write_all(b"fmt ")?;
        out.write_all(&(base_fmt.len() as u32).to_le_bytes())?;
        out.write_all(base_fmt)?;

        out.write_all(b"data")?;
        out.write_all(&total_data_size.to_le_bytes())?;
        for segment in segments {
            out.write_all(&segment.payload)?;
        }

        Ok(out)
    }
}
