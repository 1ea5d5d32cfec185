use std::time::Duration;

pub const CHANNEL_COUNT: usize = 2;
pub const SAMPLE_RATE: usize = 48000;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const TIMESTAMP_STEP: usize = SAMPLE_RATE / (1000 / FRAME_DURATION.as_millis() as usize);

/// Interleaved stereo samples in one 20 ms frame.
pub const FRAME_SAMPLES: usize = TIMESTAMP_STEP * CHANNEL_COUNT;
/// Bytes of 16-bit little-endian PCM in one 20 ms frame.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
/// Largest Opus payload the encoder is allowed to produce.
pub const MAX_OPUS_FRAME: usize = 1276;

pub const OPUS_SILENCE_FRAME: &[u8] = &[0xf8, 0xff, 0xfe];
/// Silence frames appended at end of stream to drain remote jitter buffers.
pub const OPUS_SILENCE_FRAMES: usize = 10;

/// The only encryption mode this client negotiates.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// Bound of the per-session outbound Opus queue, roughly 10 s of audio.
/// The bound is the backpressure mechanism for producers.
pub const OUTBOUND_FRAME_QUEUE: usize = 500;
/// Bound of the per-session inbound queue of transport events.
pub const INBOUND_EVENT_QUEUE: usize = 64;

/// Budget for Hello+Ready (or Hello+Resumed) and for the Session Description
/// tail of the Start handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for the parent gateway to answer a voice-state request.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between failed resume attempts.
pub const RESUME_BACKOFF: Duration = Duration::from_secs(5);

pub const HEARTBEAT_WARMUP: Duration = Duration::from_secs(1);
/// Minimum spacing between any two outgoing gateway frames.
pub const SEND_PACE: Duration = Duration::from_millis(516);
pub const UDP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
