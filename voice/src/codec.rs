//! PCM to Opus pipeline: arbitrary byte chunks in, 20 ms frames out.

use anyhow::Result;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use opus::{Application, Bitrate, Channels, Encoder};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::{FRAME_BYTES, FRAME_SAMPLES, MAX_OPUS_FRAME, SAMPLE_RATE};

/// A stream of 16-bit little-endian interleaved stereo PCM at 48 kHz.
///
/// Chunks may be any length; the pipeline re-frames them. `None` ends the
/// stream and triggers the silence flush downstream.
#[async_trait]
pub trait PcmSource: Send {
  async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Adapts a byte reader (an ffmpeg stdout pipe, a file) into a [`PcmSource`].
pub struct ReaderSource<R> {
  reader: R
}

impl<R> ReaderSource<R> {
  pub fn new(reader: R) -> Self {
    Self { reader }
  }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> PcmSource for ReaderSource<R> {
  async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
    let mut buffer = vec![0; FRAME_BYTES];
    let length = self.reader.read(&mut buffer).await?;
    if length == 0 {
      return Ok(None);
    }
    buffer.truncate(length);
    Ok(Some(buffer))
  }
}

/// Re-frames a PCM byte stream into exact 3840-byte frames.
///
/// Holds at most one partial frame between pushes. A trailing chunk shorter
/// than a frame is discarded at end of stream.
pub struct Chunker {
  pending: Vec<u8>
}

impl Chunker {
  pub fn new() -> Self {
    Self {
      pending: Vec::with_capacity(FRAME_BYTES)
    }
  }

  pub fn push(&mut self, data: &[u8]) {
    self.pending.extend_from_slice(data);
  }

  pub fn next_frame(&mut self) -> Option<[i16; FRAME_SAMPLES]> {
    if self.pending.len() < FRAME_BYTES {
      return None;
    }

    let mut samples = [0i16; FRAME_SAMPLES];
    LittleEndian::read_i16_into(&self.pending[..FRAME_BYTES], &mut samples);
    self.pending.drain(..FRAME_BYTES);
    Some(samples)
  }

  /// Bytes that would be discarded if the stream ended now.
  pub fn remainder(&self) -> usize {
    self.pending.len()
  }
}

impl Default for Chunker {
  fn default() -> Self {
    Self::new()
  }
}

/// Opus encoder fixed to the one configuration the voice gateway accepts:
/// 48 kHz stereo, `audio` application.
pub struct FrameEncoder {
  encoder: Encoder
}

impl FrameEncoder {
  pub fn new(bitrate: Option<u32>) -> Result<Self> {
    let mut encoder = Encoder::new(SAMPLE_RATE as u32, Channels::Stereo, Application::Audio)?;
    if let Some(bitrate) = bitrate {
      encoder.set_bitrate(Bitrate::Bits(i32::try_from(bitrate)?))?;
    }
    Ok(Self { encoder })
  }

  pub fn encode(&mut self, samples: &[i16; FRAME_SAMPLES]) -> Result<Vec<u8>> {
    let mut output = vec![0; MAX_OPUS_FRAME];
    let length = self.encoder.encode(samples, &mut output)?;
    output.truncate(length);
    Ok(output)
  }
}
