//! Streaming MP3 playback.
//! MP3 bytes → ffmpeg (stdin) → s16le mono PCM (stdout) → decoder thread →
//! ring buffer → cpal output callback. The decoder thread waits for ring
//! space instead of overwriting, so ffmpeg is back-pressured by playback.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::ring_buffer::RingBuffer;
use super::SpeechError;

/// Seconds of decoded audio buffered ahead of playback.
const RING_SECS: f32 = 2.0;
const READ_CHUNK_BYTES: usize = 4096;
const WAIT_STEP: Duration = Duration::from_millis(5);

struct PlaybackShared {
    ring: Mutex<RingBuffer>,
    abort: AtomicBool,
}

/// One utterance's worth of decoder + output stream.
pub struct Mp3Player {
    ffmpeg: Child,
    stdin: Option<ChildStdin>,
    decoder: Option<JoinHandle<()>>,
    shared: Arc<PlaybackShared>,
    stream: cpal::Stream,
    sample_rate: u32,
}

impl Mp3Player {
    /// Open the default output device and start ffmpeg resampling to its rate.
    pub fn start(ffmpeg_bin: &str) -> Result<Self, SpeechError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| SpeechError::Output("no audio output device available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| SpeechError::Output(format!("no default output config: {e}")))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;

        let shared = Arc::new(PlaybackShared {
            ring: Mutex::new(RingBuffer::new(sample_rate, RING_SECS)),
            abort: AtomicBool::new(false),
        });

        let config: cpal::StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, &shared)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, &shared)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, &shared)?,
            other => {
                return Err(SpeechError::Output(format!("unsupported sample format {other:?}")))
            }
        };

        let mut ffmpeg = Command::new(ffmpeg_bin)
            .args(["-i", "pipe:0", "-f", "s16le", "-ar"])
            .arg(sample_rate.to_string())
            .args(["-ac", "1", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SpeechError::Decoder(format!("failed to spawn {ffmpeg_bin}: {e}")))?;

        let stdin = ffmpeg
            .stdin
            .take()
            .ok_or_else(|| SpeechError::Decoder("failed to get ffmpeg stdin".into()))?;
        let stdout = ffmpeg
            .stdout
            .take()
            .ok_or_else(|| SpeechError::Decoder("failed to get ffmpeg stdout".into()))?;

        let shared_dec = Arc::clone(&shared);
        let decoder = std::thread::Builder::new()
            .name("tts-decoder".into())
            .spawn(move || run_decoder(stdout, shared_dec))
            .map_err(|e| SpeechError::Decoder(format!("failed to spawn decoder thread: {e}")))?;

        stream
            .play()
            .map_err(|e| SpeechError::Output(format!("failed to start output stream: {e}")))?;
        debug!(sample_rate, channels, "mp3 player started");

        Ok(Self {
            ffmpeg,
            stdin: Some(stdin),
            decoder: Some(decoder),
            shared,
            stream,
            sample_rate,
        })
    }

    /// Push a chunk of MP3 bytes to the decoder.
    pub fn feed(&mut self, mp3: &[u8]) -> Result<(), SpeechError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SpeechError::Decoder("decoder input already closed".into()))?;
        stdin
            .write_all(mp3)
            .map_err(|e| SpeechError::Decoder(format!("write to ffmpeg: {e}")))
    }

    /// Close the decoder input and block until the buffered audio played out.
    pub fn finish(mut self) -> Result<(), SpeechError> {
        drop(self.stdin.take());
        if let Some(decoder) = self.decoder.take() {
            let _ = decoder.join();
        }

        let buffered = self.shared.ring.lock().available();
        let budget = Duration::from_secs_f64(buffered as f64 / self.sample_rate as f64)
            + Duration::from_secs(1);
        let deadline = Instant::now() + budget;
        while self.shared.ring.lock().available() > 0 {
            if Instant::now() >= deadline {
                return Err(SpeechError::Output("playback stalled".into()));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        // let the device drain its own buffer
        std::thread::sleep(Duration::from_millis(100));
        let _ = self.stream.pause();

        let status = self
            .ffmpeg
            .wait()
            .map_err(|e| SpeechError::Decoder(format!("ffmpeg wait: {e}")))?;
        if !status.success() {
            return Err(SpeechError::Decoder(format!("ffmpeg exited with {status}")));
        }
        info!("playback finished");
        Ok(())
    }
}

impl Drop for Mp3Player {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        drop(self.stdin.take());
        let _ = self.ffmpeg.kill();
        if let Some(decoder) = self.decoder.take() {
            let _ = decoder.join();
        }
        let _ = self.ffmpeg.wait();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    shared: &Arc<PlaybackShared>,
) -> Result<cpal::Stream, SpeechError>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    let shared = Arc::clone(shared);
    let channels = channels.max(1);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut rb = shared.ring.lock();
                let mut sample = [0i16; 1];
                for frame in data.chunks_mut(channels) {
                    let value = if rb.read(&mut sample) == 1 {
                        T::from_sample(sample[0])
                    } else {
                        T::EQUILIBRIUM
                    };
                    frame.fill(value);
                }
            },
            |err| {
                error!(error = %err, "audio output error");
            },
            None,
        )
        .map_err(|e| SpeechError::Output(format!("failed to build output stream: {e}")))
}

/// Decoder thread: ffmpeg stdout → ring buffer.
fn run_decoder(mut stdout: std::process::ChildStdout, shared: Arc<PlaybackShared>) {
    let mut bytes = [0u8; READ_CHUNK_BYTES];
    let mut samples: Vec<i16> = Vec::with_capacity(READ_CHUNK_BYTES / 2 + 1);
    let mut carry: Option<u8> = None;

    loop {
        let n = match stdout.read(&mut bytes) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "ffmpeg stdout read failed");
                break;
            }
        };

        samples.clear();
        let mut chunk = &bytes[..n];
        if let Some(lo) = carry.take() {
            samples.push(i16::from_le_bytes([lo, chunk[0]]));
            chunk = &chunk[1..];
        }
        let mut pairs = chunk.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        carry = pairs.remainder().first().copied();

        let mut pending = &samples[..];
        while !pending.is_empty() {
            if shared.abort.load(Ordering::Relaxed) {
                return;
            }
            let written = shared.ring.lock().write(pending);
            pending = &pending[written..];
            if !pending.is_empty() {
                std::thread::sleep(WAIT_STEP);
            }
        }
    }
}
