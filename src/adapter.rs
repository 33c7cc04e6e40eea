/// Buffered engine adapter
///
/// Implements the queueing half of the detection-engine contract around an
/// opaque wake spotter: a lock-free frame ring between feed and fetch, a
/// condvar so fetch can block with a timeout, the wake-detection toggle and
/// the per-frame VAD flag. The spotting model itself stays behind
/// `WakeSpotter`, and command models behind `RecognizerFactory`.

use crate::engine::{CommandEngine, DetectionEngine, EngineError, FetchResult, WakeState};
use crate::frame::Frame;
use crate::vad::{VadConfig, VadGate};
use cache_padded::CachePadded;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a wake spotter saw in one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Spot {
    pub wake_state: WakeState,
    pub model_index: usize,
    pub word_index: usize,
    pub trigger_channel: Option<usize>,
}

/// Opaque wake-word model (WakeNet-class)
pub trait WakeSpotter: Send {
    fn spot(&mut self, frame: &Frame) -> Result<Spot, EngineError>;

    /// Forget any partial detection; called when wake detection is re-armed
    fn reset(&mut self);
}

/// Builds command recognizers by model name (MultiNet-class)
pub trait RecognizerFactory: Send + Sync {
    type Recognizer: CommandEngine;

    fn create(&self, name: &str) -> Option<Self::Recognizer>;
}

type FrameRing = HeapRb<Frame>;
type FrameProducer = <FrameRing as Split>::Prod;
type FrameConsumer = <FrameRing as Split>::Cons;

/// Everything only the fetching thread touches
struct FetchSide<W> {
    queue: FrameConsumer,
    spotter: W,
    vad: VadGate,
}

/// Detection engine built from a wake spotter and a recognizer factory
pub struct BufferedEngine<W, F> {
    chunk_size: usize,
    channels: u16,
    producer: CachePadded<Mutex<FrameProducer>>,
    fetch_side: CachePadded<Mutex<FetchSide<W>>>,
    pending: Mutex<usize>,
    ready: Condvar,
    wake_enabled: CachePadded<AtomicBool>,
    frames_fed: CachePadded<AtomicU64>,
    frames_fetched: CachePadded<AtomicU64>,
    factory: F,
}

impl<W: WakeSpotter, F: RecognizerFactory> BufferedEngine<W, F> {
    /// Create an engine expecting `chunk_size` samples per channel.
    ///
    /// `queue_slots` bounds how many fed frames may wait for fetch; size it
    /// to at least the frame pool so feed can never overrun.
    pub fn new(
        spotter: W,
        factory: F,
        chunk_size: usize,
        channels: u16,
        queue_slots: usize,
        vad_config: VadConfig,
    ) -> Self {
        info!(
            "Initializing buffered engine: chunk {} x {} channel(s), queue {} frames",
            chunk_size, channels, queue_slots
        );

        let (producer, consumer) = FrameRing::new(queue_slots.max(1)).split();

        Self {
            chunk_size,
            channels: channels.max(1),
            producer: CachePadded::new(Mutex::new(producer)),
            fetch_side: CachePadded::new(Mutex::new(FetchSide {
                queue: consumer,
                spotter,
                vad: VadGate::with_config(vad_config),
            })),
            pending: Mutex::new(0),
            ready: Condvar::new(),
            wake_enabled: CachePadded::new(AtomicBool::new(true)),
            frames_fed: CachePadded::new(AtomicU64::new(0)),
            frames_fetched: CachePadded::new(AtomicU64::new(0)),
            factory,
        }
    }

    pub fn frames_fed(&self) -> u64 {
        self.frames_fed.load(Ordering::Relaxed)
    }

    pub fn frames_fetched(&self) -> u64 {
        self.frames_fetched.load(Ordering::Relaxed)
    }

    pub fn is_wake_enabled(&self) -> bool {
        self.wake_enabled.load(Ordering::Acquire)
    }

    /// Frames fed but not yet fetched
    pub fn queued(&self) -> usize {
        *self.pending.lock()
    }
}

impl<W: WakeSpotter, F: RecognizerFactory> DetectionEngine for BufferedEngine<W, F> {
    type Recognizer = F::Recognizer;

    fn feed_chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn feed_channels(&self) -> u16 {
        self.channels
    }

    fn feed(&self, frame: Frame) -> Result<(), EngineError> {
        let expected = self.chunk_size * self.channels as usize;
        if frame.len() != expected {
            return Err(EngineError::FrameShape {
                expected,
                actual: frame.len(),
            });
        }

        let seq = frame.seq();
        self.producer.lock().try_push(frame).map_err(|_| {
            warn!("Engine queue full, refusing frame {}", seq);
            EngineError::Overrun(seq)
        })?;
        self.frames_fed.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.lock();
        *pending += 1;
        self.ready.notify_one();

        Ok(())
    }

    fn fetch(&self, timeout: Duration) -> Result<Option<FetchResult>, EngineError> {
        {
            let mut pending = self.pending.lock();
            if *pending == 0 {
                self.ready
                    .wait_while_for(&mut pending, |queued| *queued == 0, timeout);
                if *pending == 0 {
                    return Ok(None);
                }
            }
            *pending -= 1;
        }

        let mut side = self.fetch_side.lock();
        let frame = side.queue.try_pop().ok_or_else(|| {
            EngineError::Fault("frame queue empty despite pending count".to_string())
        })?;

        let stride = self.channels as usize;
        let (vad, _) = side.vad.process_channel(frame.samples(), 0, stride);

        let spot = if self.wake_enabled.load(Ordering::Acquire) {
            side.spotter.spot(&frame)?
        } else {
            Spot::default()
        };
        drop(side);

        self.frames_fetched.fetch_add(1, Ordering::Relaxed);

        Ok(Some(FetchResult {
            vad,
            wake_state: spot.wake_state,
            model_index: spot.model_index,
            word_index: spot.word_index,
            trigger_channel: spot.trigger_channel,
            frame: Some(frame),
        }))
    }

    fn enable_wake_detection(&self, enabled: bool) {
        let previous = self.wake_enabled.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return;
        }

        if enabled {
            self.fetch_side.lock().spotter.reset();
        }
        debug!("Wake detection {}", if enabled { "enabled" } else { "disabled" });
    }

    fn create_command_recognizer(&self, name: &str) -> Result<Self::Recognizer, EngineError> {
        let recognizer = self
            .factory
            .create(name)
            .ok_or_else(|| EngineError::RecognizerNotFound(name.to_string()))?;
        info!("Command recognizer created: {}", name);
        Ok(recognizer)
    }
}

impl<W, F> Drop for BufferedEngine<W, F> {
    fn drop(&mut self) {
        let queued = self.fetch_side.lock().queue.occupied_len();
        if queued > 0 {
            debug!("Dropping buffered engine with {} unfetched frame(s)", queued);
        }
    }
}
