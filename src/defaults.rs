//! Default configuration constants for tutorlink.
//!
//! Shared constants used across the capture, playback, and session layers
//! to keep the two pipelines and the wire format in agreement.

/// Canonical capture sample rate in Hz.
///
/// 16kHz mono is what the remote tutoring agent expects on the wire and is
/// the standard rate for speech pipelines.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Playback sample rate in Hz.
///
/// Agent audio arrives at 24kHz. The capture and playback pipelines run at
/// independent rates; neither resamples the other.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Capture block duration in milliseconds.
///
/// One block becomes one outbound audio frame. Smaller blocks increase
/// framing overhead, larger blocks increase end-to-end latency.
pub const CAPTURE_BLOCK_MS: u32 = 100;

/// Samples per capture block at the canonical rate (mono).
pub const CAPTURE_BLOCK_SAMPLES: usize =
    (CAPTURE_SAMPLE_RATE as usize * CAPTURE_BLOCK_MS as usize) / 1000;

/// Playback ring buffer length in seconds.
///
/// Sized so a long agent answer never wraps under normal conditions; when
/// it does wrap, the oldest unplayed samples are dropped.
pub const PLAYBACK_BUFFER_SECS: u32 = 180;

/// Bounded depth of the outbound audio block queue, in blocks.
///
/// When the network cannot keep pace with capture, the newest block is
/// dropped rather than blocking the capture path.
pub const SEND_QUEUE_BLOCKS: usize = 32;

/// Bounded depth of the transport event channel.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Polling interval for the capture block assembler when no samples are
/// available (ms).
pub const CAPTURE_POLL_INTERVAL_MS: u64 = 10;

/// Default websocket endpoint of the tutoring agent service.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws";

/// Default user id when none is configured.
pub const DEFAULT_USER_ID: &str = "student";
