/// Frame module: fixed-length PCM chunks and the pool they live in
///
/// Frames are allocated once when the pool is built and then circulate:
/// capture takes a free frame, fills it, feeds it to the engine, and the
/// detection side hands it back after the fetch result is consumed.
/// The free list is a lock-free SPSC ring, so neither side waits on the other.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::debug;

/// Audio sample format (16-bit PCM)
pub type Sample = i16;

/// Default capture rate for WakeNet/MultiNet-class engines
pub const SAMPLE_RATE: u32 = 16000;

/// Default samples per channel in one frame (32ms at 16kHz)
pub const DEFAULT_CHUNK_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid pool size: {0}")]
    InvalidSize(usize),

    #[error("Foreign frame: expected {expected} samples, got {actual}")]
    ForeignFrame { expected: usize, actual: usize },

    #[error("Pool overflow: frame {0} returned to a full pool")]
    Overflow(u64),
}

/// One processing chunk of interleaved samples plus its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    seq: u64,
    channels: u16,
    samples: Box<[Sample]>,
}

impl Frame {
    /// Allocate a zeroed frame. Only the pool should call this in a running pipeline.
    pub fn new(samples_per_channel: usize, channels: u16) -> Self {
        let channels = channels.max(1);
        Self {
            seq: 0,
            channels,
            samples: vec![0; samples_per_channel * channels as usize].into_boxed_slice(),
        }
    }

    /// Sequence number assigned by the audio source
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn stamp(&mut self, seq: u64) {
        self.seq = seq;
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total interleaved samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Copy one channel out of the interleaved buffer.
    ///
    /// Returns the number of samples written to `out`.
    pub fn copy_channel(&self, channel: usize, out: &mut [Sample]) -> usize {
        let stride = self.channels as usize;
        if channel >= stride {
            return 0;
        }

        let mut written = 0;
        for (dst, src) in out
            .iter_mut()
            .zip(self.samples.iter().skip(channel).step_by(stride))
        {
            *dst = *src;
            written += 1;
        }
        written
    }

    /// Duration of the frame at the given sample rate
    pub fn duration_secs(&self, sample_rate: u32) -> f32 {
        self.samples_per_channel() as f32 / sample_rate as f32
    }
}

type FrameRing = HeapRb<Frame>;
type FrameProducer = <FrameRing as Split>::Prod;
type FrameConsumer = <FrameRing as Split>::Cons;

/// Pre-allocated set of frames shared between capture and detection
pub struct FramePool {
    taker: FrameTaker,
    returner: FrameReturner,
}

impl FramePool {
    /// Allocate `slots` frames of `samples_per_channel * channels` samples each
    pub fn new(slots: usize, samples_per_channel: usize, channels: u16) -> Result<Self, PoolError> {
        if slots == 0 {
            return Err(PoolError::InvalidSize(slots));
        }
        if samples_per_channel == 0 {
            return Err(PoolError::InvalidSize(samples_per_channel));
        }

        debug!(
            "Creating frame pool: {} slots x {} samples x {} channels",
            slots, samples_per_channel, channels
        );

        let rb = FrameRing::new(slots);
        let (mut producer, consumer) = rb.split();
        for _ in 0..slots {
            // Ring capacity equals slot count, so every push fits
            let _ = producer.try_push(Frame::new(samples_per_channel, channels));
        }

        let frame_len = samples_per_channel * channels.max(1) as usize;

        Ok(Self {
            taker: FrameTaker { free: consumer },
            returner: FrameReturner {
                free: producer,
                frame_len,
            },
        })
    }

    /// Split into the capture half and the detection half
    pub fn split(self) -> (FrameTaker, FrameReturner) {
        (self.taker, self.returner)
    }
}

/// Capture-side half of the pool
pub struct FrameTaker {
    free: FrameConsumer,
}

impl FrameTaker {
    /// Take a free frame, or `None` if every frame is in flight
    pub fn take(&mut self) -> Option<Frame> {
        self.free.try_pop()
    }

    /// Frames currently free
    pub fn available(&self) -> usize {
        self.free.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity().get()
    }
}

/// Detection-side half of the pool
pub struct FrameReturner {
    free: FrameProducer,
    frame_len: usize,
}

impl FrameReturner {
    /// Return a consumed frame to the free list
    pub fn give_back(&mut self, frame: Frame) -> Result<(), PoolError> {
        if frame.len() != self.frame_len {
            return Err(PoolError::ForeignFrame {
                expected: self.frame_len,
                actual: frame.len(),
            });
        }

        let seq = frame.seq();
        self.free
            .try_push(frame)
            .map_err(|_| PoolError::Overflow(seq))
    }

    /// Frames the detection side may still return before the pool is full
    pub fn in_flight(&self) -> usize {
        self.free.vacant_len()
    }
}
