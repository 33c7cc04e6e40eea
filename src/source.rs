/// Audio source module
///
/// `AudioDevice` opens a stream in a given format and hands back an
/// `AudioHandle`; `AudioSource` wraps the handle and turns raw reads into
/// whole, sequence-stamped frames. Short reads are errors, never padded.
/// Timeouts and short reads are retried with bounded backoff and escalate
/// to a device fault once the retry budget is spent.

use crate::frame::{Frame, Sample, SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Device fault: {0}")]
    DeviceFault(String),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Short read: expected {expected} samples, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("End of stream")]
    EndOfStream,
}

impl SourceError {
    /// Transient errors are retried without touching pipeline state
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Timeout(_) | SourceError::ShortRead { .. })
    }
}

/// Driver buffering hints (DMA descriptor count and length in frames)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferingHints {
    pub buffer_count: usize,
    pub buffer_frames: usize,
}

impl Default for BufferingHints {
    fn default() -> Self {
        Self {
            buffer_count: 6,
            buffer_frames: 160,
        }
    }
}

/// Format requested from the audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bit_width: u16,
    pub channels: u16,
    #[serde(default)]
    pub buffering: BufferingHints,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            bit_width: 16,
            channels: 1,
            buffering: BufferingHints::default(),
        }
    }
}

/// Opens capture streams
pub trait AudioDevice {
    type Handle: AudioHandle;

    fn open(&mut self, format: &StreamFormat) -> Result<Self::Handle, SourceError>;
}

/// An open capture stream
#[cfg_attr(test, mockall::automock)]
pub trait AudioHandle: Send {
    /// Fill `buf` with interleaved samples, waiting at most `timeout`.
    ///
    /// Returns the number of samples written. Anything less than
    /// `buf.len()` is treated as a short read by the caller.
    fn read(&mut self, buf: &mut [Sample], timeout: Duration) -> Result<usize, SourceError>;
}

impl<H: AudioHandle + ?Sized> AudioHandle for Box<H> {
    fn read(&mut self, buf: &mut [Sample], timeout: Duration) -> Result<usize, SourceError> {
        (**self).read(buf, timeout)
    }
}

/// Bounded exponential backoff for transient read errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Frame-oriented reader over an open handle
pub struct AudioSource<H> {
    handle: H,
    read_timeout: Duration,
    retry: RetryPolicy,
    next_seq: u64,
    transient_errors: u64,
}

impl<H: AudioHandle> AudioSource<H> {
    /// Open `device` in `format` and wrap the resulting handle
    pub fn open<D>(
        device: &mut D,
        format: &StreamFormat,
        read_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError>
    where
        D: AudioDevice<Handle = H>,
    {
        if format.bit_width != 16 {
            return Err(SourceError::UnsupportedFormat(format!(
                "bit width {} (only 16-bit PCM is supported)",
                format.bit_width
            )));
        }

        let handle = device.open(format)?;
        info!(
            "Audio source open: {} Hz, {} channel(s), {}-bit",
            format.sample_rate, format.channels, format.bit_width
        );

        Ok(Self::new(handle, read_timeout, retry))
    }

    pub fn new(handle: H, read_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            handle,
            read_timeout,
            retry,
            next_seq: 0,
            transient_errors: 0,
        }
    }

    /// Fill `frame` completely and stamp it with the next sequence number.
    ///
    /// Transient failures are retried per the retry policy; once exhausted
    /// they escalate to `DeviceFault`. The sequence number only advances on
    /// success, so fed frames never skip or repeat a number.
    pub fn read_frame(&mut self, frame: &mut Frame) -> Result<(), SourceError> {
        let mut attempt = 0;

        loop {
            match self.read_once(frame) {
                Ok(()) => {
                    frame.stamp(self.next_seq);
                    self.next_seq += 1;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    self.transient_errors += 1;
                    attempt += 1;

                    if attempt > self.retry.max_retries {
                        warn!(
                            "Giving up on frame {} after {} retries: {}",
                            self.next_seq, self.retry.max_retries, e
                        );
                        return Err(SourceError::DeviceFault(format!(
                            "{} retries exhausted, last error: {}",
                            self.retry.max_retries, e
                        )));
                    }

                    let delay = self.retry.delay(attempt);
                    debug!("Transient read error ({}), retry {} in {:?}", e, attempt, delay);
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One read attempt; a partial fill is reported as `ShortRead`
    fn read_once(&mut self, frame: &mut Frame) -> Result<(), SourceError> {
        let expected = frame.len();
        let actual = self.handle.read(frame.samples_mut(), self.read_timeout)?;

        if actual < expected {
            return Err(SourceError::ShortRead { expected, actual });
        }
        Ok(())
    }

    /// Sequence number the next successful frame will carry
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Transient errors absorbed by retries so far
    pub fn transient_errors(&self) -> u64 {
        self.transient_errors
    }
}
