/// Detection engine contract
///
/// The acoustic front-end and the wake/command models are opaque. The
/// pipeline only relies on the feed/fetch contract below: frames go in
/// from the capture context, results come out in the detection context.

use crate::frame::{Frame, Sample};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine fault: {0}")]
    Fault(String),

    #[error("Feed overrun: engine queue full at frame {0}")]
    Overrun(u64),

    #[error("Frame shape mismatch: expected {expected} samples, got {actual}")]
    FrameShape { expected: usize, actual: usize },

    #[error("Command recognizer not found: {0}")]
    RecognizerNotFound(String),
}

/// Wake-word spotting state reported with each fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeState {
    #[default]
    None,
    /// A wake word was spotted on at least one channel
    Detected,
    /// The channel that triggered the wake word has been confirmed
    ChannelVerified,
}

/// One fetch cycle's worth of engine output
#[derive(Debug, Default)]
pub struct FetchResult {
    /// Voice activity in this chunk
    pub vad: bool,
    pub wake_state: WakeState,
    pub model_index: usize,
    pub word_index: usize,
    /// Channel that triggered the wake word (multi-mic engines only)
    pub trigger_channel: Option<usize>,
    /// Audio consumed for this result, handed back to the core for command
    /// recognition and then returned to the frame pool
    pub frame: Option<Frame>,
}

impl FetchResult {
    /// A plain result carrying a frame and nothing else
    pub fn with_frame(frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            ..Default::default()
        }
    }
}

/// One ranked command hypothesis
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMatch {
    pub command_id: u32,
    pub phrase_id: u32,
    pub confidence: f32,
    pub transcript: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Still listening for a command
    Detecting,
    /// Matches ranked by confidence, highest first
    Detected(Vec<CommandMatch>),
    /// The recognizer gave up on its own
    Timeout { partial: String },
}

/// Sort matches by confidence, highest first. Stable for equal scores.
pub fn rank_matches(matches: &mut [CommandMatch]) {
    matches.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// Command-phrase recognizer (MultiNet-class)
#[cfg_attr(test, mockall::automock)]
pub trait CommandEngine: Send {
    /// Consume one mono chunk
    fn detect(&mut self, samples: &[Sample]) -> CommandOutcome;

    /// Drop all accumulated context
    fn reset(&mut self);

    /// Best transcript so far, reported on timeout
    fn partial_transcript(&self) -> String {
        String::new()
    }
}

/// Acoustic front-end with wake-word spotting (AFE + WakeNet-class)
///
/// `feed` and `fetch` are called from different threads, so the engine is
/// shared by reference and synchronizes internally.
///
/// Every fed frame must eventually come back through `FetchResult::frame`,
/// otherwise the frame pool drains and capture reports an overrun.
pub trait DetectionEngine: Sync {
    type Recognizer: CommandEngine;

    /// Samples per channel the engine expects in each fed frame
    fn feed_chunk_size(&self) -> usize;

    /// Interleaved channels in each fed frame
    fn feed_channels(&self) -> u16;

    /// Whether wake detections need a channel-verification step
    fn is_multi_channel(&self) -> bool {
        self.feed_channels() > 1
    }

    /// Non-blocking handoff of one captured frame
    fn feed(&self, frame: Frame) -> Result<(), EngineError>;

    /// Block until a result is ready or `timeout` passes (`Ok(None)`)
    fn fetch(&self, timeout: Duration) -> Result<Option<FetchResult>, EngineError>;

    /// Idempotent wake-detection toggle
    fn enable_wake_detection(&self, enabled: bool);

    fn create_command_recognizer(&self, name: &str) -> Result<Self::Recognizer, EngineError>;
}
