//! Microphone capture pipeline: device acquisition, block assembly, and
//! delivery to the non-real-time sender path.
//!
//! The hardware callback only copies samples into an accumulation buffer.
//! A dedicated polling thread assembles fixed-size blocks at the canonical
//! rate and hands them over a bounded channel; when the consumer cannot
//! keep pace the newest block is dropped so capture timing is never
//! disturbed.

use crate::defaults;
use crate::error::{Result, TutorlinkError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for audio capture devices.
///
/// This trait allows swapping implementations (real microphone vs mock).
pub trait CaptureSource: Send {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Drain the samples accumulated since the last read.
    ///
    /// # Returns
    /// PCM16 mono samples at the canonical capture rate. An empty vector
    /// means no new samples yet.
    fn read_samples(&mut self) -> Result<Vec<i16>>;
}

/// Configuration for the capture pipeline.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Optional capture device name. None selects the best default.
    pub device: Option<String>,
    /// Canonical capture sample rate (Hz, mono).
    pub sample_rate: u32,
    /// Samples per emitted block.
    pub block_samples: usize,
    /// Bounded depth of the block channel.
    pub queue_blocks: usize,
    /// Polling interval when no samples are available (ms).
    pub poll_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            block_samples: defaults::CAPTURE_BLOCK_SAMPLES,
            queue_blocks: defaults::SEND_QUEUE_BLOCKS,
            poll_interval_ms: defaults::CAPTURE_POLL_INTERVAL_MS,
        }
    }
}

/// One fixed-size block of captured audio, independently owned by the
/// receiver.
#[derive(Debug, Clone)]
pub struct CaptureBlock {
    /// Monotonically increasing block number.
    pub sequence: u64,
    /// PCM16 mono samples at the capture rate.
    pub samples: Vec<i16>,
}

/// Handle to a running capture session.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureHandle {
    /// Stop capture and release the device before returning. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("capture thread panicked during shutdown");
        }
    }

    /// True while the polling thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Status flag set by the polling thread on persistent device failure.
    ///
    /// The capture path never raises; the control path inspects this flag
    /// and forces audio off.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Capture pipeline that assembles fixed-size blocks from a source.
pub struct AudioCapture {
    source: Box<dyn CaptureSource>,
    config: CaptureConfig,
}

/// Consecutive read failures tolerated before capture gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

impl AudioCapture {
    /// Creates a capture pipeline with default configuration.
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self::with_config(source, CaptureConfig::default())
    }

    /// Creates a capture pipeline with custom configuration.
    pub fn with_config(source: Box<dyn CaptureSource>, config: CaptureConfig) -> Self {
        Self { source, config }
    }

    /// Acquire the device and begin block delivery.
    ///
    /// Returns the block receiver and a handle. On failure nothing is
    /// acquired — there is no dangling device handle to clean up.
    ///
    /// # Errors
    /// `CaptureUnavailable` when the device cannot be opened.
    pub fn start(mut self) -> Result<(crossbeam_channel::Receiver<CaptureBlock>, CaptureHandle)> {
        self.source.start()?;

        let (tx, rx) = crossbeam_channel::bounded(self.config.queue_blocks);
        let running = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));

        let thread_running = running.clone();
        let thread_failed = failed.clone();
        let block_samples = self.config.block_samples;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut source = self.source;

        let thread = thread::spawn(move || {
            let mut pending: Vec<i16> = Vec::with_capacity(block_samples * 2);
            let mut sequence: u64 = 0;
            let mut consecutive_errors: u32 = 0;
            let mut dropped: u64 = 0;

            while thread_running.load(Ordering::SeqCst) {
                match source.read_samples() {
                    Ok(samples) if !samples.is_empty() => {
                        consecutive_errors = 0;
                        pending.extend_from_slice(&samples);

                        while pending.len() >= block_samples {
                            let block_samples_vec: Vec<i16> =
                                pending.drain(..block_samples).collect();
                            let block = CaptureBlock {
                                sequence,
                                samples: block_samples_vec,
                            };
                            sequence += 1;

                            match tx.try_send(block) {
                                Ok(()) => {}
                                Err(crossbeam_channel::TrySendError::Full(_)) => {
                                    // Consumer lagging: drop the newest block
                                    // rather than stalling capture.
                                    dropped += 1;
                                    if dropped.is_power_of_two() {
                                        debug!(dropped, "capture queue full, dropping block");
                                    }
                                }
                                Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                                    thread_running.store(false, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                    }
                    Ok(_) => {
                        // No samples yet — normal at startup while the
                        // device initializes.
                        thread::sleep(poll_interval);
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            warn!(error = %e, "capture failed repeatedly, giving up");
                            thread_failed.store(true, Ordering::SeqCst);
                            thread_running.store(false, Ordering::SeqCst);
                            break;
                        }
                        thread::sleep(poll_interval);
                    }
                }
            }

            if let Err(e) = source.stop() {
                warn!(error = %e, "failed to stop capture source");
            }
        });

        let handle = CaptureHandle {
            running,
            failed,
            thread: Mutex::new(Some(thread)),
        };

        Ok((rx, handle))
    }
}

/// Mix multi-channel PCM16 audio down to mono by averaging channels.
pub(crate) fn mixdown_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for the native-config capture fallback.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = source_pos.floor() as usize;
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[samples.len() - 1]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

/// Mock capture source for testing.
pub struct MockCaptureSource {
    is_started: bool,
    batches: Vec<Vec<i16>>,
    next_batch: usize,
    repeat_last: bool,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockCaptureSource {
    /// Create a mock that returns no samples.
    pub fn new() -> Self {
        Self {
            is_started: false,
            batches: Vec::new(),
            next_batch: 0,
            repeat_last: false,
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock capture error".to_string(),
        }
    }

    /// Configure the batches returned by successive `read_samples` calls.
    /// After the last batch, reads return empty.
    pub fn with_batches(mut self, batches: Vec<Vec<i16>>) -> Self {
        self.batches = batches;
        self
    }

    /// Repeat the final batch forever instead of going empty.
    pub fn with_repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Configure the mock to fail on start.
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read.
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures.
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the source is started.
    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl Default for MockCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MockCaptureSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            Err(TutorlinkError::CaptureUnavailable {
                message: self.error_message.clone(),
            })
        } else {
            self.is_started = true;
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(TutorlinkError::CaptureUnavailable {
                message: self.error_message.clone(),
            });
        }
        if self.next_batch < self.batches.len() {
            let batch = self.batches[self.next_batch].clone();
            self.next_batch += 1;
            Ok(batch)
        } else if self.repeat_last && !self.batches.is_empty() {
            Ok(self.batches[self.batches.len() - 1].clone())
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.block_samples, 1600);
        assert_eq!(config.queue_blocks, 32);
        assert!(config.device.is_none());
    }

    #[test]
    fn test_mock_source_returns_batches_then_empty() {
        let mut source =
            MockCaptureSource::new().with_batches(vec![vec![1i16, 2], vec![3i16, 4, 5]]);
        assert_eq!(source.read_samples().unwrap(), vec![1i16, 2]);
        assert_eq!(source.read_samples().unwrap(), vec![3i16, 4, 5]);
        assert_eq!(source.read_samples().unwrap(), Vec::<i16>::new());
    }

    #[test]
    fn test_mock_source_start_failure() {
        let mut source = MockCaptureSource::new()
            .with_start_failure()
            .with_error_message("device busy");
        let result = source.start();
        assert!(!source.is_started());
        match result {
            Err(TutorlinkError::CaptureUnavailable { message }) => {
                assert_eq!(message, "device busy");
            }
            _ => panic!("Expected CaptureUnavailable"),
        }
    }

    #[test]
    fn test_start_failure_acquires_nothing() {
        let capture = AudioCapture::new(Box::new(MockCaptureSource::new().with_start_failure()));
        let result = capture.start();
        assert!(matches!(
            result,
            Err(TutorlinkError::CaptureUnavailable { .. })
        ));
    }

    #[test]
    fn test_blocks_are_fixed_size_and_sequenced() {
        let config = CaptureConfig {
            block_samples: 4,
            poll_interval_ms: 1,
            ..Default::default()
        };
        // 10 samples over two reads → two complete blocks of 4, remainder 2
        // stays pending.
        let source = MockCaptureSource::new().with_batches(vec![vec![1i16; 6], vec![2i16; 4]]);
        let capture = AudioCapture::with_config(Box::new(source), config);

        let (rx, handle) = capture.start().unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.samples.len(), 4);
        assert_eq!(second.samples.len(), 4);
        assert_eq!(first.samples, vec![1i16; 4]);
        assert_eq!(second.samples, vec![1i16, 1, 2, 2]);

        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let source = MockCaptureSource::new();
        let (_rx, handle) = AudioCapture::new(Box::new(source)).start().unwrap();
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_persistent_read_failure_sets_flag() {
        let config = CaptureConfig {
            poll_interval_ms: 1,
            ..Default::default()
        };
        let source = MockCaptureSource::new().with_read_failure();
        let (_rx, handle) = AudioCapture::with_config(Box::new(source), config)
            .start()
            .unwrap();

        // 10 consecutive errors at 1ms polling — give it some slack.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !handle.has_failed() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.has_failed());
        handle.stop();
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let config = CaptureConfig {
            block_samples: 2,
            queue_blocks: 2,
            poll_interval_ms: 1,
            ..Default::default()
        };
        // 10 blocks' worth of samples arrive at once; the queue holds 2.
        let source = MockCaptureSource::new().with_batches(vec![vec![7i16; 20]]);
        let (rx, handle) = AudioCapture::with_config(Box::new(source), config)
            .start()
            .unwrap();

        thread::sleep(Duration::from_millis(100));

        // The two oldest blocks survive; the later ones were dropped.
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert!(rx.try_recv().is_err());

        handle.stop();
    }

    #[test]
    fn test_dropped_receiver_stops_capture() {
        let config = CaptureConfig {
            block_samples: 2,
            poll_interval_ms: 1,
            ..Default::default()
        };
        let source = MockCaptureSource::new()
            .with_batches(vec![vec![1i16; 8]])
            .with_repeat_last();
        let (rx, handle) = AudioCapture::with_config(Box::new(source), config)
            .start()
            .unwrap();

        drop(rx);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!handle.is_running());
        handle.stop();
    }

    #[test]
    fn test_mixdown_mono_passthrough() {
        let samples = vec![100i16, 200, 300];
        assert_eq!(mixdown_to_mono(&samples, 1), samples);
    }

    #[test]
    fn test_mixdown_stereo_averages() {
        let samples = vec![100i16, 300, -200, 200];
        assert_eq!(mixdown_to_mono(&samples, 2), vec![200i16, 0]);
    }

    #[test]
    fn test_resample_identity_same_rate() {
        let samples = vec![100i16, 200, 300, 400, 500];
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_resample_halves_length_on_downsample() {
        let samples = vec![0i16; 480];
        let out = resample(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn test_resample_interpolates_upsample() {
        let samples = vec![0i16, 100];
        let out = resample(&samples, 8_000, 16_000);
        assert_eq!(out.len(), 4);
        // Interpolated midpoint lands between the two input samples.
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
    }
}
