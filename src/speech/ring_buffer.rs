//! Playback ring buffer: fixed pre-allocated circular buffer for decoded PCM.
//! The decoder thread writes, the cpal output callback reads. Unlike a capture
//! buffer, writes never overwrite unread samples; the writer waits on
//! `free()` instead.

/// Fixed-size ring buffer for PCM i16 samples. Pre-allocated, never grows.
pub struct RingBuffer {
    buffer: Box<[i16]>,
    write_pos: usize,
    read_pos: usize,
    len: usize,
}

impl RingBuffer {
    /// Create a ring buffer sized for `duration_secs` at `sample_rate` Hz, mono.
    pub fn new(sample_rate: u32, duration_secs: f32) -> Self {
        let capacity = ((sample_rate as f32 * duration_secs) as usize).max(1);
        Self {
            buffer: vec![0i16; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            len: 0,
        }
    }

    /// Write as many samples as fit. Returns the number written.
    #[inline]
    pub fn write(&mut self, samples: &[i16]) -> usize {
        let to_write = samples.len().min(self.free());
        for &s in &samples[..to_write] {
            self.buffer[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.capacity();
        }
        self.len += to_write;
        to_write
    }

    /// Read available samples into output buffer.
    /// Returns the number of samples actually read.
    #[inline]
    pub fn read(&mut self, output: &mut [i16]) -> usize {
        let to_read = output.len().min(self.len);
        for slot in output.iter_mut().take(to_read) {
            *slot = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.capacity();
        }
        self.len -= to_read;
        to_read
    }

    /// Number of unread samples available.
    #[inline]
    pub fn available(&self) -> usize {
        self.len
    }

    /// Space left before the writer has to wait.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all unread samples.
    pub fn clear(&mut self) {
        self.read_pos = self.write_pos;
        self.len = 0;
    }
}
