/// Pipeline orchestration
///
/// Owns the source, engine, recognizer, sink and frame pool, and runs the
/// two execution contexts over them:
///
/// - capture: take a free frame, `read_frame`, `feed`
/// - detection: `fetch`, step the controller, watch for prolonged silence,
///   return the frame to the pool
///
/// Both are named threads scoped to `run`, so they borrow the pipeline
/// instead of sharing it through globals. A fatal error from either side
/// stops both; `on_fault` is reported once, after both have joined.

use crate::config::{ConfigError, PipelineConfig};
use crate::controller::{ControllerConfig, ControllerStats, PipelineController, PipelineState};
use crate::engine::{DetectionEngine, EngineError};
use crate::events::EventSink;
use crate::frame::{FramePool, FrameReturner, FrameTaker, PoolError, SAMPLE_RATE};
use crate::models::{ModelError, ModelSet};
use crate::source::{AudioHandle, AudioSource, SourceError};
use crate::vad::SilenceMonitor;
use cache_padded::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Audio source error: {0}")]
    Source(#[from] SourceError),

    #[error("Detection engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Frame pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Frame pool exhausted at frame {0}: detection fell behind capture")]
    Overrun(u64),

    #[error("Failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),

    #[error("{0} thread panicked")]
    ContextPanicked(&'static str),
}

/// Shared shutdown flag, polled at the top of each loop
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<CachePadded<AtomicBool>>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_fed: u64,
    pub transient_read_errors: u64,
    pub controller: ControllerStats,
    pub final_state: PipelineState,
}

/// First fatal error wins; errors raised after a stop request are only logged
struct FaultSlot {
    first: Mutex<Option<PipelineError>>,
    stop: StopToken,
}

impl FaultSlot {
    fn raise(&self, context: &str, err: PipelineError) {
        let mut first = self.first.lock();
        if first.is_none() && !self.stop.is_stopped() {
            error!("Fatal error in {} context: {}", context, err);
            *first = Some(err);
        } else {
            warn!("Error in {} context during shutdown: {}", context, err);
        }
        self.stop.stop();
    }

    /// Run `f` only if no stop has been requested. Holds the slot lock, so a
    /// fault raised concurrently lands either before the check or after `f`.
    fn unless_stopped<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let _first = self.first.lock();
        if self.stop.is_stopped() {
            None
        } else {
            Some(f())
        }
    }
}

pub struct Pipeline<H, E: DetectionEngine, S> {
    source: AudioSource<H>,
    engine: E,
    recognizer: E::Recognizer,
    sink: S,
    pool: FramePool,
    controller_config: ControllerConfig,
    fetch_timeout: Duration,
    silence: Option<SilenceMonitor>,
    stop: StopToken,
}

impl<H, E, S> Pipeline<H, E, S>
where
    H: AudioHandle,
    E: DetectionEngine,
    S: EventSink,
{
    /// Assemble a pipeline; every configuration problem surfaces here
    pub fn new(
        config: &PipelineConfig,
        source: AudioSource<H>,
        engine: E,
        models: &ModelSet,
        sink: S,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let expected = config.chunk_size * config.channels as usize;
        let actual = engine.feed_chunk_size() * engine.feed_channels() as usize;
        if engine.feed_chunk_size() != config.chunk_size
            || engine.feed_channels() != config.channels
        {
            return Err(EngineError::FrameShape { expected, actual }.into());
        }

        let command_model = models.require(
            &config.command_model_prefix,
            config.command_model_keyword.as_deref(),
        )?;
        let recognizer = engine.create_command_recognizer(command_model.name())?;
        info!("Command model: {}", command_model.name());

        let pool = FramePool::new(config.frame_pool_slots, config.chunk_size, config.channels)?;

        Ok(Self {
            source,
            engine,
            recognizer,
            sink,
            pool,
            controller_config: config.controller(),
            fetch_timeout: config.fetch_timeout(),
            silence: config.silence_monitor(),
            stop: StopToken::new(),
        })
    }

    /// Token that stops a running pipeline from another thread
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Run until stopped, the source ends, or a fatal error.
    ///
    /// Consumes the pipeline: recovery from a fault is a full rebuild.
    pub fn run(self) -> Result<PipelineReport, PipelineError> {
        let Pipeline {
            source,
            engine,
            recognizer,
            mut sink,
            pool,
            controller_config,
            fetch_timeout,
            silence,
            stop,
        } = self;

        let (taker, returner) = pool.split();
        let faults = FaultSlot {
            first: Mutex::new(None),
            stop: stop.clone(),
        };
        let capture_done = CachePadded::new(AtomicBool::new(false));

        info!("Starting pipeline");

        let outcome = thread::scope(|scope| {
            let capture = thread::Builder::new()
                .name("capture".to_string())
                .spawn_scoped(scope, || {
                    let result = capture_loop(source, taker, &engine, &stop, &faults);
                    capture_done.store(true, Ordering::Release);
                    result
                })
                .map_err(|e| PipelineError::Spawn("capture", e))?;

            let detection = thread::Builder::new()
                .name("detection".to_string())
                .spawn_scoped(scope, || {
                    let controller =
                        PipelineController::new(&engine, recognizer, controller_config);
                    detection_loop(
                        controller,
                        returner,
                        &engine,
                        &mut sink,
                        fetch_timeout,
                        silence,
                        &capture_done,
                        &stop,
                        &faults,
                    )
                });

            let detection = match detection {
                Ok(handle) => handle,
                Err(e) => {
                    stop.stop();
                    let _ = capture.join();
                    return Err(PipelineError::Spawn("detection", e));
                }
            };

            let captured = capture.join();
            if captured.is_err() {
                // Detection only drains on end of capture or stop
                stop.stop();
            }
            let detected = detection.join();

            let (frames_fed, transient_read_errors) =
                captured.map_err(|_| PipelineError::ContextPanicked("capture"))?;
            let (controller, final_state) =
                detected.map_err(|_| PipelineError::ContextPanicked("detection"))?;

            Ok(PipelineReport {
                frames_fed,
                transient_read_errors,
                controller,
                final_state,
            })
        });

        let outcome = match faults.first.into_inner() {
            Some(err) => Err(err),
            None => outcome,
        };

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                sink.on_fault(&err.to_string());
                return Err(err);
            }
        };

        info!(
            "Pipeline stopped: {} frames fed, {} cycles, {} wake events, {} commands, {} timeouts",
            report.frames_fed,
            report.controller.cycles,
            report.controller.wake_events,
            report.controller.commands_recognized,
            report.controller.command_timeouts
        );
        Ok(report)
    }
}

/// Capture context: returns frames fed and transient read errors absorbed
fn capture_loop<H: AudioHandle, E: DetectionEngine>(
    mut source: AudioSource<H>,
    mut taker: FrameTaker,
    engine: &E,
    stop: &StopToken,
    faults: &FaultSlot,
) -> (u64, u64) {
    debug!("Capture context started ({} frames in pool)", taker.capacity());
    let mut fed = 0u64;

    while !stop.is_stopped() {
        let Some(mut frame) = taker.take() else {
            faults.raise("capture", PipelineError::Overrun(source.next_seq()));
            break;
        };

        match source.read_frame(&mut frame) {
            Ok(()) => {}
            Err(SourceError::EndOfStream) => {
                info!("Audio source ended after {} frames", fed);
                break;
            }
            Err(e) => {
                faults.raise("capture", e.into());
                break;
            }
        }

        // A fault may have landed while the read was blocked
        match faults.unless_stopped(|| engine.feed(frame)) {
            Some(Ok(())) => fed += 1,
            Some(Err(e)) => {
                faults.raise("capture", e.into());
                break;
            }
            None => {
                let seq = source.next_seq().saturating_sub(1);
                debug!("Stopped during read, frame {} not fed", seq);
                break;
            }
        }
    }

    debug!("Capture context exiting");
    (fed, source.transient_errors())
}

/// Detection context: returns controller stats and the final state
#[allow(clippy::too_many_arguments)]
fn detection_loop<E: DetectionEngine, S: EventSink>(
    mut controller: PipelineController<'_, E>,
    mut returner: FrameReturner,
    engine: &E,
    sink: &mut S,
    fetch_timeout: Duration,
    mut silence: Option<SilenceMonitor>,
    capture_done: &AtomicBool,
    stop: &StopToken,
    faults: &FaultSlot,
) -> (ControllerStats, PipelineState) {
    debug!("Detection context started");

    while !stop.is_stopped() {
        // Sampled before fetch so an empty fetch after this proves the queue drained
        let drained = capture_done.load(Ordering::Acquire);

        match engine.fetch(fetch_timeout) {
            Ok(Some(mut result)) => {
                controller.step(&result, sink);
                if let Some(frame) = result.frame.take() {
                    let silent = silence
                        .as_mut()
                        .and_then(|monitor| monitor.observe(frame.samples()));
                    if let Some(frames) = silent {
                        let secs = frame.duration_secs(SAMPLE_RATE) * frames as f32;
                        info!("No sound above the silence threshold for {:.1}s", secs);
                        sink.on_silence_timeout(Duration::from_secs_f32(secs));
                    }

                    if let Err(e) = returner.give_back(frame) {
                        faults.raise("detection", e.into());
                        break;
                    }
                }
            }
            Ok(None) if drained => {
                debug!("Engine drained after end of capture");
                break;
            }
            Ok(None) => {}
            Err(e) => {
                faults.raise("detection", e.into());
                break;
            }
        }
    }

    debug!(
        "Detection context exiting ({} frame(s) not returned)",
        returner.in_flight()
    );
    (controller.stats(), controller.state())
}
