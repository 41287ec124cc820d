//! Fixed-capacity circular buffer decoupling network audio arrival from
//! real-time playback.
//!
//! One writer (the network-receive path) and one reader (the render
//! callback). The writer never blocks: when the buffer is full the oldest
//! unplayed sample is overwritten. The reader never waits: when the buffer
//! is empty it repeats the last played sample.
//!
//! All storage is allocated at construction; `enqueue` and `dequeue_into`
//! only take a short, constant-bounded critical section, so the render
//! callback stays inside its period budget.

use std::sync::Mutex;

struct RingState {
    buffer: Box<[f32]>,
    write_index: usize,
    read_index: usize,
    len: usize,
    /// Last sample handed to the reader; repeated on underflow so a gap
    /// holds the output steady instead of snapping to zero.
    last: f32,
}

/// Circular audio buffer shared between the network writer and the render
/// callback reader.
pub struct CircularAudioBuffer {
    state: Mutex<RingState>,
    capacity: usize,
}

impl CircularAudioBuffer {
    /// Create a buffer holding `capacity` samples. All memory is allocated
    /// here; the audio path never allocates.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            state: Mutex::new(RingState {
                buffer: vec![0.0f32; capacity].into_boxed_slice(),
                write_index: 0,
                read_index: 0,
                len: 0,
                last: 0.0,
            }),
            capacity,
        }
    }

    /// Create a buffer sized for `secs` seconds at `sample_rate` Hz, mono.
    pub fn with_duration(sample_rate: u32, secs: u32) -> Self {
        Self::new((sample_rate as usize) * (secs as usize))
    }

    /// Append samples, overwriting the oldest unread sample when full.
    ///
    /// Called from the network-receive path. Never blocks the writer and
    /// never allocates.
    pub fn enqueue(&self, samples: &[f32]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = self.capacity;
        for &s in samples {
            let write_index = state.write_index;
            state.buffer[write_index] = s;
            state.write_index = (write_index + 1) % capacity;
            if state.len == capacity {
                // Full: drop the oldest sample by advancing the reader.
                state.read_index = (state.read_index + 1) % capacity;
            } else {
                state.len += 1;
            }
        }
    }

    /// Fill `output` from the buffer, repeating the last sample once the
    /// buffer runs dry.
    ///
    /// Called from the render callback. Bounded by `output.len()` work and
    /// free of allocation.
    pub fn dequeue_into(&self, output: &mut [f32]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = self.capacity;
        for slot in output.iter_mut() {
            if state.len > 0 {
                let sample = state.buffer[state.read_index];
                state.read_index = (state.read_index + 1) % capacity;
                state.len -= 1;
                state.last = sample;
                *slot = sample;
            } else {
                *slot = state.last;
            }
        }
    }

    /// Discard all buffered-but-unplayed samples (barge-in). The hold
    /// sample resets to silence so a discarded stream does not linger.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.read_index = state.write_index;
        state.len = 0;
        state.last = 0.0;
    }

    /// Number of unread samples.
    pub fn available(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).len
    }

    /// Fixed capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
