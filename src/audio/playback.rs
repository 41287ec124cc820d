//! Speaker playback pipeline: agent audio bytes in, hardware-clocked
//! rendering out.
//!
//! Network audio is decoded and enqueued from the control path; a cpal
//! output callback drains the ring at the device's pace. The callback does
//! no allocation, no I/O, and no logging — underflow repeats the last
//! sample, overflow drops the oldest unplayed audio.

use crate::audio::codec;
use crate::audio::ring::CircularAudioBuffer;
use crate::defaults;
use crate::error::Result;
use std::sync::Arc;

#[cfg(feature = "cpal-audio")]
use crate::error::TutorlinkError;
#[cfg(feature = "cpal-audio")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
#[cfg(feature = "cpal-audio")]
use std::sync::Mutex;
#[cfg(feature = "cpal-audio")]
use tracing::warn;

/// Configuration for the playback pipeline.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Playback sample rate (Hz). Independent of the capture rate.
    pub sample_rate: u32,
    /// Ring buffer length in seconds.
    pub buffer_secs: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::PLAYBACK_SAMPLE_RATE,
            buffer_secs: defaults::PLAYBACK_BUFFER_SECS,
        }
    }
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only accessed through the Mutex in
/// `AudioRenderer`, one thread at a time.
#[cfg(feature = "cpal-audio")]
struct SendableStream(cpal::Stream);

#[cfg(feature = "cpal-audio")]
unsafe impl Send for SendableStream {}

/// Playback pipeline owning the circular buffer and the output stream.
pub struct AudioRenderer {
    buffer: Arc<CircularAudioBuffer>,
    config: RendererConfig,
    #[cfg(feature = "cpal-audio")]
    stream: Mutex<Option<SendableStream>>,
}

impl AudioRenderer {
    /// Creates a renderer with default configuration.
    pub fn new() -> Self {
        Self::with_config(RendererConfig::default())
    }

    /// Creates a renderer with custom configuration.
    pub fn with_config(config: RendererConfig) -> Self {
        Self {
            buffer: Arc::new(CircularAudioBuffer::with_duration(
                config.sample_rate,
                config.buffer_secs,
            )),
            config,
            #[cfg(feature = "cpal-audio")]
            stream: Mutex::new(None),
        }
    }

    /// Decode PCM16 bytes and enqueue them for playback.
    ///
    /// Called from the network-receive context, never from the render
    /// callback. When the ring is full the oldest unplayed samples are
    /// overwritten; that is a documented degradation, not an error.
    ///
    /// # Errors
    /// `Decode` when the byte count is odd.
    pub fn push(&self, bytes: &[u8]) -> Result<()> {
        let samples = codec::bytes_to_pcm16(bytes)?;
        self.buffer.enqueue(&codec::pcm16_to_float(&samples));
        Ok(())
    }

    /// Discard buffered-but-unplayed audio immediately (barge-in, context
    /// teardown).
    pub fn clear(&self) {
        self.buffer.reset();
    }

    /// Number of samples waiting to be rendered.
    pub fn buffered_samples(&self) -> usize {
        self.buffer.available()
    }

    /// Playback sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Begin periodic rendering on the default output device.
    ///
    /// Idempotent: starting an already-started renderer is a no-op. The
    /// output stream is requested at the configured playback rate; a device
    /// that cannot run at that rate is `PlaybackUnavailable` rather than
    /// silently playing at the wrong pitch.
    #[cfg(feature = "cpal-audio")]
    pub fn start(&self) -> Result<()> {
        {
            let guard = self
                .stream
                .lock()
                .map_err(|e| TutorlinkError::PlaybackUnavailable {
                    message: format!("Failed to lock stream: {}", e),
                })?;
            if guard.is_some() {
                return Ok(());
            }
        }

        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| TutorlinkError::PlaybackUnavailable {
                message: format!("Failed to start playback stream: {}", e),
            })?;

        let mut guard = self
            .stream
            .lock()
            .map_err(|e| TutorlinkError::PlaybackUnavailable {
                message: format!("Failed to lock stream: {}", e),
            })?;
        *guard = Some(SendableStream(stream));
        Ok(())
    }

    /// Halt the periodic callback and release the output device.
    /// Idempotent.
    #[cfg(feature = "cpal-audio")]
    pub fn stop(&self) -> Result<()> {
        let mut guard = self
            .stream
            .lock()
            .map_err(|e| TutorlinkError::PlaybackUnavailable {
                message: format!("Failed to lock stream: {}", e),
            })?;

        // Dropping the stream releases the device deterministically.
        if let Some(sendable) = guard.take() {
            sendable
                .0
                .pause()
                .map_err(|e| TutorlinkError::PlaybackUnavailable {
                    message: format!("Failed to stop playback stream: {}", e),
                })?;
        }
        Ok(())
    }

    #[cfg(feature = "cpal-audio")]
    fn build_stream(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let host = cpal::default_host();
        let device =
            host.default_output_device()
                .ok_or_else(|| TutorlinkError::PlaybackUnavailable {
                    message: "No output device available".to_string(),
                })?;

        let default_config =
            device
                .default_output_config()
                .map_err(|e| TutorlinkError::PlaybackUnavailable {
                    message: format!("Failed to query default output config: {}", e),
                })?;

        let channels = default_config.channels();
        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            warn!(error = %err, "playback stream error");
        };

        let ring = Arc::clone(&self.buffer);
        let channel_count = channels as usize;
        // Scratch for one callback's worth of mono samples, allocated once
        // here and reused inside the callback.
        let mut scratch = vec![0.0f32; self.config.sample_rate as usize];

        match default_config.sample_format() {
            SampleFormat::F32 => device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for frames in data.chunks_mut(scratch.len() * channel_count) {
                            let mono_len = frames.len() / channel_count;
                            let mono = &mut scratch[..mono_len];
                            ring.dequeue_into(mono);
                            // Fan the mono signal out to every output channel.
                            for (frame, &sample) in
                                frames.chunks_mut(channel_count).zip(mono.iter())
                            {
                                frame.fill(sample);
                            }
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| TutorlinkError::PlaybackUnavailable {
                    message: format!("Failed to build f32 output stream: {}", e),
                }),
            SampleFormat::I16 => device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        for frames in data.chunks_mut(scratch.len() * channel_count) {
                            let mono_len = frames.len() / channel_count;
                            let mono = &mut scratch[..mono_len];
                            ring.dequeue_into(mono);
                            for (frame, &sample) in
                                frames.chunks_mut(channel_count).zip(mono.iter())
                            {
                                frame.fill((sample.clamp(-1.0, 1.0) * 32767.0).round() as i16);
                            }
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| TutorlinkError::PlaybackUnavailable {
                    message: format!("Failed to build i16 output stream: {}", e),
                }),
            fmt => Err(TutorlinkError::PlaybackUnavailable {
                message: format!("Unsupported output sample format: {:?}", fmt),
            }),
        }
    }
}

impl Default for AudioRenderer {
    fn default() -> Self {
        Self::new()
    }
}
