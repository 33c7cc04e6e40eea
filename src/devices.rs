/// Concrete audio devices
///
/// `WavFileDevice` replays a 16-bit PCM WAV file, optionally paced to real
/// time. `CpalDevice` captures from a system microphone: the driver callback
/// pushes samples into a lock-free ring and the handle drains whole frames
/// out of it.

use crate::frame::Sample;
use crate::source::{AudioDevice, AudioHandle, SourceError, StreamFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single wait for the capture callback. Covers wakeups lost when
/// the driver callback finds the signal lock contended and notifies without it.
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Replays a WAV file as a capture stream
pub struct WavFileDevice {
    path: PathBuf,
    speed: Option<f32>,
}

impl WavFileDevice {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            speed: None,
        }
    }

    /// Deliver samples no faster than `speed` times real time
    pub fn paced(mut self, speed: f32) -> Self {
        self.speed = (speed > 0.0).then_some(speed);
        self
    }
}

impl AudioDevice for WavFileDevice {
    type Handle = WavHandle;

    fn open(&mut self, format: &StreamFormat) -> Result<WavHandle, SourceError> {
        let reader = hound::WavReader::open(&self.path).map_err(|e| {
            SourceError::DeviceFault(format!("cannot open {}: {}", self.path.display(), e))
        })?;

        let header = reader.spec();
        if header.sample_format != hound::SampleFormat::Int
            || header.bits_per_sample != format.bit_width
        {
            return Err(SourceError::UnsupportedFormat(format!(
                "{}: {}-bit {:?}, expected {}-bit PCM",
                self.path.display(),
                header.bits_per_sample,
                header.sample_format,
                format.bit_width
            )));
        }
        if header.sample_rate != format.sample_rate || header.channels != format.channels {
            return Err(SourceError::UnsupportedFormat(format!(
                "{}: {} Hz x {} channel(s), expected {} Hz x {}",
                self.path.display(),
                header.sample_rate,
                header.channels,
                format.sample_rate,
                format.channels
            )));
        }

        info!(
            "Replaying {} ({} samples per channel)",
            self.path.display(),
            reader.duration()
        );

        Ok(WavHandle {
            samples: reader.into_samples::<i16>(),
            samples_per_sec: header.sample_rate as f64 * header.channels as f64,
            speed: self.speed,
            started: None,
            delivered: 0,
        })
    }
}

pub struct WavHandle {
    samples: hound::WavIntoSamples<BufReader<File>, i16>,
    samples_per_sec: f64,
    speed: Option<f32>,
    started: Option<Instant>,
    delivered: u64,
}

impl WavHandle {
    /// Sleep until `delivered` samples are due
    fn pace(&mut self) {
        let Some(speed) = self.speed else {
            return;
        };
        let started = *self.started.get_or_insert_with(Instant::now);
        let due =
            Duration::from_secs_f64(self.delivered as f64 / self.samples_per_sec / speed as f64);
        if let Some(wait) = due.checked_sub(started.elapsed()) {
            std::thread::sleep(wait);
        }
    }
}

impl AudioHandle for WavHandle {
    fn read(&mut self, buf: &mut [Sample], _timeout: Duration) -> Result<usize, SourceError> {
        let mut filled = 0;
        for slot in buf.iter_mut() {
            match self.samples.next() {
                Some(Ok(sample)) => {
                    *slot = sample;
                    filled += 1;
                }
                Some(Err(e)) => return Err(SourceError::DeviceFault(format!("WAV decode: {}", e))),
                None => break,
            }
        }

        if filled == 0 {
            return Err(SourceError::EndOfStream);
        }

        self.delivered += filled as u64;
        self.pace();
        Ok(filled)
    }
}

type SampleRing = HeapRb<Sample>;
type SampleProducer = <SampleRing as Split>::Prod;
type SampleConsumer = <SampleRing as Split>::Cons;

/// State shared between the driver callback and the handle
#[derive(Default)]
struct CaptureSignal {
    lock: Mutex<()>,
    ready: Condvar,
    overrun: AtomicBool,
    failure: Mutex<Option<String>>,
}

/// System microphone via cpal.
///
/// The stream lives here, on the thread that opened it; only the handle
/// crosses into the capture context.
pub struct CpalDevice {
    device_name: Option<String>,
    stream: Option<cpal::Stream>,
}

impl CpalDevice {
    /// Default input device
    pub fn new() -> Self {
        Self {
            device_name: None,
            stream: None,
        }
    }

    /// Input device whose name matches exactly
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
            stream: None,
        }
    }

    fn select_device(&self, host: &cpal::Host) -> Result<cpal::Device, SourceError> {
        match &self.device_name {
            Some(wanted) => host
                .input_devices()
                .map_err(|e| SourceError::DeviceFault(format!("cannot list input devices: {}", e)))?
                .find(|d| d.name().map(|n| n == *wanted).unwrap_or(false))
                .ok_or_else(|| {
                    SourceError::DeviceFault(format!("input device '{}' not found", wanted))
                }),
            None => host
                .default_input_device()
                .ok_or_else(|| SourceError::DeviceFault("no default input device".to_string())),
        }
    }
}

/// One capture-capable device as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub name: String,
    pub default_sample_rate: u32,
    pub max_channels: u16,
}

/// Input devices of the default host, in host order
pub fn input_devices() -> Result<Vec<InputDeviceInfo>, SourceError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| SourceError::DeviceFault(format!("cannot list input devices: {}", e)))?;

    let mut found = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        match device.default_input_config() {
            Ok(config) => found.push(InputDeviceInfo {
                name,
                default_sample_rate: config.sample_rate().0,
                max_channels: config.channels(),
            }),
            Err(e) => debug!("Skipping input device '{}': {}", name, e),
        }
    }
    Ok(found)
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalDevice {
    type Handle = CpalHandle;

    fn open(&mut self, format: &StreamFormat) -> Result<CpalHandle, SourceError> {
        let host = cpal::default_host();
        let device = self.select_device(&host)?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let sample_format = device
            .default_input_config()
            .map_err(|e| SourceError::DeviceFault(format!("{}: {}", name, e)))?
            .sample_format();

        let hints = format.buffering;
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: if hints.buffer_frames > 0 {
                cpal::BufferSize::Fixed(hints.buffer_frames as u32)
            } else {
                cpal::BufferSize::Default
            },
        };

        // Room for every driver buffer plus a second of slack
        let channels = format.channels as usize;
        let capacity = hints.buffer_count.max(1) * hints.buffer_frames.max(1) * channels
            + format.sample_rate as usize * channels;
        let (mut producer, consumer) = SampleRing::new(capacity).split();
        let signal = Arc::new(CaptureSignal::default());

        let on_error = {
            let signal = Arc::clone(&signal);
            move |err: cpal::StreamError| {
                error!("Audio stream error: {}", err);
                *signal.failure.lock() = Some(err.to_string());
                let _guard = signal.lock.lock();
                signal.ready.notify_one();
            }
        };

        let stream = match sample_format {
            cpal::SampleFormat::I16 => {
                let signal = Arc::clone(&signal);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        push_samples(&mut producer, &signal, data.iter().copied());
                    },
                    on_error,
                    None,
                )
            }
            cpal::SampleFormat::F32 => {
                let signal = Arc::clone(&signal);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        push_samples(&mut producer, &signal, data.iter().map(|&s| to_pcm16(s)));
                    },
                    on_error,
                    None,
                )
            }
            other => {
                return Err(SourceError::UnsupportedFormat(format!(
                    "{}: sample format {:?}",
                    name, other
                )))
            }
        }
        .map_err(|e| SourceError::UnsupportedFormat(format!("{}: {}", name, e)))?;

        stream
            .play()
            .map_err(|e| SourceError::DeviceFault(format!("{}: {}", name, e)))?;

        info!(
            "Capturing from '{}': {} Hz x {} channel(s), ring {} samples",
            name, format.sample_rate, format.channels, capacity
        );

        self.stream = Some(stream);
        Ok(CpalHandle { consumer, signal })
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closing capture stream");
        }
    }
}

fn to_pcm16(sample: f32) -> Sample {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as Sample
}

/// Runs on the driver thread: never blocks, never allocates
fn push_samples(
    producer: &mut SampleProducer,
    signal: &CaptureSignal,
    samples: impl Iterator<Item = Sample>,
) {
    for sample in samples {
        if producer.try_push(sample).is_err() {
            signal.overrun.store(true, Ordering::Release);
            break;
        }
    }

    // Notifying under the lock closes the check-then-wait gap in `read`;
    // the driver thread never waits for it
    let _guard = signal.lock.try_lock();
    signal.ready.notify_one();
}

/// Capture-side end of a cpal stream
pub struct CpalHandle {
    consumer: SampleConsumer,
    signal: Arc<CaptureSignal>,
}

impl AudioHandle for CpalHandle {
    /// Only hands out whole frames; a partial frame stays queued for the retry
    fn read(&mut self, buf: &mut [Sample], timeout: Duration) -> Result<usize, SourceError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.signal.overrun.load(Ordering::Acquire) {
                warn!("Capture ring overrun, samples were lost");
                return Err(SourceError::DeviceFault("capture ring overrun".to_string()));
            }
            if let Some(reason) = self.signal.failure.lock().take() {
                return Err(SourceError::DeviceFault(reason));
            }

            if self.consumer.occupied_len() >= buf.len() {
                return Ok(self.consumer.pop_slice(buf));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SourceError::Timeout(timeout));
            }

            let mut guard = self.signal.lock.lock();
            if self.consumer.occupied_len() < buf.len() {
                self.signal
                    .ready
                    .wait_for(&mut guard, (deadline - now).min(WAIT_SLICE));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::source::{AudioSource, RetryPolicy};
    use tempfile::TempDir;

    fn write_wav(dir: &TempDir, name: &str, channels: u16, samples: &[i16]) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn format(channels: u16) -> StreamFormat {
        StreamFormat {
            channels,
            ..StreamFormat::default()
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_wav_device_reads_frames_then_ends() {
        let dir = TempDir::new().unwrap();
        let samples: Vec<i16> = (0..64).collect();
        let path = write_wav(&dir, "clip.wav", 1, &samples);

        let mut device = WavFileDevice::new(&path);
        let timeout = Duration::from_millis(10);
        let mut source = AudioSource::open(&mut device, &format(1), timeout, no_retry()).unwrap();

        let mut frame = Frame::new(32, 1);
        source.read_frame(&mut frame).unwrap();
        assert_eq!(frame.seq(), 0);
        assert_eq!(frame.samples()[31], 31);

        source.read_frame(&mut frame).unwrap();
        assert_eq!(frame.seq(), 1);
        assert_eq!(frame.samples()[0], 32);

        assert!(matches!(source.read_frame(&mut frame), Err(SourceError::EndOfStream)));
    }

    #[test]
    fn test_wav_partial_tail_is_not_delivered() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "tail.wav", 1, &[7; 40]);

        let mut device = WavFileDevice::new(&path);
        let timeout = Duration::from_millis(10);
        let mut source = AudioSource::open(&mut device, &format(1), timeout, no_retry()).unwrap();

        let mut frame = Frame::new(32, 1);
        source.read_frame(&mut frame).unwrap();
        // 8 leftover samples: a short read, then the end of the file
        assert!(matches!(source.read_frame(&mut frame), Err(SourceError::EndOfStream)));
        assert_eq!(source.next_seq(), 1);
        assert_eq!(source.transient_errors(), 1);
    }

    #[test]
    fn test_wav_format_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "stereo.wav", 2, &[0; 64]);

        let result = WavFileDevice::new(&path).open(&format(1));
        assert!(matches!(result, Err(SourceError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_wav_missing_file_is_device_fault() {
        let dir = TempDir::new().unwrap();
        let result = WavFileDevice::new(dir.path().join("missing.wav")).open(&format(1));
        assert!(matches!(result, Err(SourceError::DeviceFault(_))));
    }

    #[test]
    fn test_wav_pacing_holds_back_samples() {
        let dir = TempDir::new().unwrap();
        // 1600 samples is 100ms at 16kHz
        let path = write_wav(&dir, "paced.wav", 1, &[0; 1600]);

        let mut handle = WavFileDevice::new(&path).paced(2.0).open(&format(1)).unwrap();
        let mut buf = vec![0; 1600];
        let start = Instant::now();
        assert_eq!(handle.read(&mut buf, Duration::from_millis(10)).unwrap(), 1600);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_cpal_handle_waits_for_whole_frame() {
        let (mut producer, consumer) = SampleRing::new(64).split();
        let signal = Arc::new(CaptureSignal::default());
        let mut handle = CpalHandle {
            consumer,
            signal: Arc::clone(&signal),
        };

        push_samples(&mut producer, &signal, [1, 2, 3].into_iter());
        let mut buf = [0; 4];
        assert!(matches!(
            handle.read(&mut buf, Duration::from_millis(10)),
            Err(SourceError::Timeout(_))
        ));

        push_samples(&mut producer, &signal, [4].into_iter());
        assert_eq!(handle.read(&mut buf, Duration::from_millis(10)).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_cpal_handle_wakes_on_push() {
        let (mut producer, consumer) = SampleRing::new(64).split();
        let signal = Arc::new(CaptureSignal::default());
        let mut handle = CpalHandle {
            consumer,
            signal: Arc::clone(&signal),
        };

        let pusher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            push_samples(&mut producer, &signal, [7; 4].into_iter());
        });

        let mut buf = [0; 4];
        assert_eq!(handle.read(&mut buf, Duration::from_secs(2)).unwrap(), 4);
        assert_eq!(buf, [7; 4]);
        pusher.join().unwrap();
    }

    #[test]
    fn test_cpal_handle_reports_overrun() {
        let (mut producer, consumer) = SampleRing::new(2).split();
        let signal = Arc::new(CaptureSignal::default());
        let mut handle = CpalHandle {
            consumer,
            signal: Arc::clone(&signal),
        };

        push_samples(&mut producer, &signal, [1, 2, 3].into_iter());
        let mut buf = [0; 2];
        assert!(matches!(
            handle.read(&mut buf, Duration::from_millis(10)),
            Err(SourceError::DeviceFault(_))
        ));
    }

    #[test]
    fn test_pcm16_conversion_clamps() {
        assert_eq!(to_pcm16(0.0), 0);
        assert_eq!(to_pcm16(1.0), i16::MAX);
        assert_eq!(to_pcm16(4.0), i16::MAX);
        assert_eq!(to_pcm16(-4.0), -i16::MAX);
    }
}
