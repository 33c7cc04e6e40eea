/// Voice-trigger pipeline library
///
/// Always-on wake-word and command detection: an audio source feeds
/// fixed-size frames to a detection engine, and a controller turns the
/// engine's per-frame results into wake, command, timeout and fault events.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod devices;
pub mod engine;
pub mod events;
pub mod frame;
pub mod models;
pub mod phrases;
pub mod pipeline;
pub mod source;
pub mod standin;
pub mod vad;

// Re-export main types
pub use adapter::{BufferedEngine, RecognizerFactory, Spot, WakeSpotter};
pub use config::{ConfigError, PipelineConfig};
pub use controller::{ControllerConfig, ControllerStats, PipelineController, PipelineState};
pub use devices::{input_devices, CpalDevice, InputDeviceInfo, WavFileDevice};
pub use engine::{
    CommandEngine, CommandMatch, CommandOutcome, DetectionEngine, EngineError, FetchResult,
    WakeState,
};
pub use events::{ChannelSink, EventSink, LogSink, PipelineEvent};
pub use frame::{Frame, FramePool, PoolError, Sample, DEFAULT_CHUNK_SIZE, SAMPLE_RATE};
pub use models::{ModelError, ModelHandle, ModelSet, MULTINET_PREFIX, WAKENET_PREFIX};
pub use phrases::{PhraseCommandEngine, PhraseRecognizerFactory, PhraseTable, Transcriber};
pub use pipeline::{Pipeline, PipelineError, PipelineReport, StopToken};
pub use source::{AudioDevice, AudioHandle, AudioSource, RetryPolicy, SourceError, StreamFormat};
pub use standin::{BurstRecognizer, BurstRecognizerFactory, BurstTranscriber, EnergySpotter};
pub use vad::{
    rms_dbfs, SilenceConfig, SilenceMonitor, VadConfig, VadError, VadGate, VadState,
};
