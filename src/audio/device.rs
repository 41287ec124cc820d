//! Real microphone capture using CPAL.
//!
//! The device is asked for 16kHz mono PCM16 directly; devices that only
//! expose float formats or their native rate/channel layout fall back to
//! software conversion (channel mixdown + linear resampling).

use crate::audio::capture::{CaptureSource, mixdown_to_mono, resample};
use crate::defaults;
use crate::error::{Result, TutorlinkError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// Suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers while
/// probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2.
/// Safe as long as no other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for PipeWire/PulseAudio environments.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns not useful for voice input.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List available audio input devices, filtering out obviously unusable
/// ones and marking preferred devices with "\[recommended\]".
///
/// # Errors
/// Returns `TutorlinkError::CaptureUnavailable` if enumeration fails.
pub fn list_capture_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _ = host; // keep host alive while iterating devices
    let devices = devices.map_err(|e| TutorlinkError::CaptureUnavailable {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Get the best default input device, preferring PipeWire/PulseAudio so
/// the desktop's device selection is respected.
fn get_best_default_device() -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        host.default_input_device()
            .ok_or_else(|| TutorlinkError::CaptureDeviceNotFound {
                device: "default".to_string(),
            })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only accessed through the Mutex in
/// `CpalCaptureSource`, one thread at a time.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture source producing 16kHz mono PCM16.
pub struct CpalCaptureSource {
    device: cpal::Device,
    stream: Arc<Mutex<Option<SendableStream>>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    sample_rate: u32,
}

impl CpalCaptureSource {
    /// Create a capture source for the named device, or the best default
    /// when `device_name` is None.
    ///
    /// # Errors
    /// `CaptureDeviceNotFound` when the named device does not exist,
    /// `CaptureUnavailable` when enumeration fails.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = with_suppressed_stderr(|| {
            let host = cpal::default_host();

            if let Some(name) = device_name {
                let devices = host
                    .input_devices()
                    .map_err(|e| TutorlinkError::CaptureUnavailable {
                        message: format!("Failed to enumerate devices: {}", e),
                    })?;

                for dev in devices {
                    if let Ok(dev_name) = dev.name()
                        && dev_name == name
                    {
                        return Ok(dev);
                    }
                }

                Err(TutorlinkError::CaptureDeviceNotFound {
                    device: name.to_string(),
                })
            } else {
                get_best_default_device()
            }
        })?;

        Ok(Self {
            device,
            stream: Arc::new(Mutex::new(None)),
            buffer: Arc::new(Mutex::new(Vec::new())),
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
        })
    }

    /// Build the input stream.
    ///
    /// Tries in order:
    /// 1. i16 at the canonical rate, mono — zero-conversion path
    /// 2. f32 at the canonical rate, mono
    /// 3. Device-native config with software mixdown + resampling
    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            warn!(error = %err, "capture stream error");
        };

        // The data callback only copies samples out; block assembly and
        // conversion to wire bytes happen on the polling thread.
        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(
                        data.iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                    );
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Build a stream at the device's native config, converting in
    /// software. Some PipeWire-ALSA setups accept non-native configs but
    /// never deliver data.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| TutorlinkError::CaptureUnavailable {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;

        let stream_config: cpal::StreamConfig = default_config.clone().into();

        warn!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native capture format, converting in software"
        );

        let err_callback = |err| {
            warn!(error = %err, "capture stream error");
        };

        let buffer = Arc::clone(&self.buffer);

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let mono = mixdown_to_mono(data, native_channels);
                        let converted = resample(&mono, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| TutorlinkError::CaptureUnavailable {
                    message: format!("Failed to build native i16 stream: {}", e),
                }),
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let i16_data: Vec<i16> = data
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                            .collect();
                        let mono = mixdown_to_mono(&i16_data, native_channels);
                        let converted = resample(&mono, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| TutorlinkError::CaptureUnavailable {
                    message: format!("Failed to build native f32 stream: {}", e),
                }),
            fmt => Err(TutorlinkError::CaptureUnavailable {
                message: format!("Unsupported native sample format: {:?}", fmt),
            }),
        }
    }
}

impl CaptureSource for CpalCaptureSource {
    fn start(&mut self) -> Result<()> {
        {
            let stream_guard =
                self.stream
                    .lock()
                    .map_err(|e| TutorlinkError::CaptureUnavailable {
                        message: format!("Failed to lock stream: {}", e),
                    })?;
            if stream_guard.is_some() {
                return Ok(()); // Already started
            }
        }

        let stream = self.build_stream()?;
        stream.play().map_err(|e| TutorlinkError::CaptureUnavailable {
            message: format!("Failed to start capture stream: {}", e),
        })?;

        let mut stream_guard =
            self.stream
                .lock()
                .map_err(|e| TutorlinkError::CaptureUnavailable {
                    message: format!("Failed to lock stream: {}", e),
                })?;
        *stream_guard = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut stream_guard =
            self.stream
                .lock()
                .map_err(|e| TutorlinkError::CaptureUnavailable {
                    message: format!("Failed to lock stream: {}", e),
                })?;

        // Dropping the stream releases the device deterministically.
        if let Some(sendable_stream) = stream_guard.take() {
            sendable_stream
                .0
                .pause()
                .map_err(|e| TutorlinkError::CaptureUnavailable {
                    message: format!("Failed to stop capture stream: {}", e),
                })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|e| TutorlinkError::CaptureUnavailable {
                message: format!("Failed to lock capture buffer: {}", e),
            })?;

        Ok(std::mem::take(&mut *buffer))
    }
}
