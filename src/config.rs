/// Pipeline configuration
///
/// Loaded from a JSON file by the service binary and then overridden by
/// environment variables. Every field has a default suitable for a single
/// 16kHz microphone.

use crate::controller::ControllerConfig;
use crate::frame::{DEFAULT_CHUNK_SIZE, SAMPLE_RATE};
use crate::models::{MULTINET_PREFIX, WAKENET_PREFIX};
use crate::source::{BufferingHints, RetryPolicy, StreamFormat};
use crate::phrases::{PhraseTable, DEFAULT_MATCH_THRESHOLD};
use crate::vad::{SilenceConfig, SilenceMonitor, VadConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture rate (WakeNet/MultiNet-class models expect 16kHz)
    pub sample_rate: u32,

    pub bit_width: u16,

    /// Interleaved microphone channels
    pub channels: u16,

    /// Samples per channel in one frame
    pub chunk_size: usize,

    pub buffering: BufferingHints,

    /// Per-attempt device read timeout
    pub read_timeout_ms: u64,

    /// Transient read failures tolerated per frame before a device fault
    pub max_read_retries: u32,

    pub retry_backoff_ms: u64,

    pub max_retry_backoff_ms: u64,

    /// Upper bound on one blocking fetch; bounds shutdown latency
    pub fetch_timeout_ms: u64,

    /// Frames allocated for the pipeline's lifetime
    pub frame_pool_slots: usize,

    /// Fetch cycles allowed for channel verification
    pub verify_timeout_cycles: u64,

    /// Fetch cycles allowed for a command after the wake word
    pub command_timeout_cycles: u64,

    /// Directory listing the available models
    pub models_dir: PathBuf,

    pub wake_model_prefix: String,

    pub command_model_prefix: String,

    /// Language tag picked out of command model names, e.g. "en"
    pub command_model_keyword: Option<String>,

    pub vad: VadConfig,

    /// Command phrases; empty keeps the burst-counting recognizer
    pub phrases: Vec<String>,

    /// Minimum phrase score for a command match
    pub match_threshold: f32,

    pub silence: SilenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            bit_width: 16,
            channels: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffering: BufferingHints::default(),
            read_timeout_ms: 100,
            max_read_retries: 5,
            retry_backoff_ms: 10,
            max_retry_backoff_ms: 200,
            fetch_timeout_ms: 100,
            frame_pool_slots: 32,
            verify_timeout_cycles: 32,
            command_timeout_cycles: 150, // ~4.8s at 32ms chunks
            models_dir: PathBuf::from("model"),
            wake_model_prefix: WAKENET_PREFIX.to_string(),
            command_model_prefix: MULTINET_PREFIX.to_string(),
            command_model_keyword: None,
            vad: VadConfig::default(),
            phrases: Vec::new(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            silence: SilenceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate != SAMPLE_RATE {
            return Err(ConfigError::Invalid(format!(
                "Sample rate must be {} Hz",
                SAMPLE_RATE
            )));
        }

        if self.bit_width != 16 {
            return Err(ConfigError::Invalid(
                "Only 16-bit PCM is supported".to_string(),
            ));
        }

        if self.channels == 0 || self.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "channels and chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.frame_pool_slots < 2 {
            return Err(ConfigError::Invalid(
                "frame_pool_slots must be at least 2".to_string(),
            ));
        }

        if self.read_timeout_ms == 0 || self.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if self.verify_timeout_cycles == 0 || self.command_timeout_cycles == 0 {
            return Err(ConfigError::Invalid(
                "timeout windows must be at least one cycle".to_string(),
            ));
        }

        self.vad
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("VAD config error: {}", e)))?;

        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::Invalid(
                "match_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.phrases.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "command phrases must not be empty".to_string(),
            ));
        }

        self.silence
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("Silence config error: {}", e)))?;

        Ok(())
    }

    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            bit_width: self.bit_width,
            channels: self.channels,
            buffering: self.buffering,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_read_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_retry_backoff_ms),
        }
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            verify_timeout_cycles: self.verify_timeout_cycles,
            command_timeout_cycles: self.command_timeout_cycles,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Fetch cycles covering `duration` of audio at this chunk size
    pub fn cycles_for(&self, duration: Duration) -> u64 {
        let chunk_ms = (self.chunk_size as u64 * 1000) / self.sample_rate as u64;
        (duration.as_millis() as u64).div_ceil(chunk_ms.max(1))
    }

    /// Phrase table for the transcript-matching recognizer, if phrases are set
    pub fn phrase_table(&self) -> Option<PhraseTable> {
        if self.phrases.is_empty() {
            return None;
        }
        Some(PhraseTable::from_phrases(&self.phrases).with_threshold(self.match_threshold))
    }

    /// Prolonged-silence monitor with its windows converted to cycles
    pub fn silence_monitor(&self) -> Option<SilenceMonitor> {
        if !self.silence.enabled {
            return None;
        }
        let cycles = |secs: f32| self.cycles_for(Duration::from_secs_f32(secs));
        Some(SilenceMonitor::new(
            cycles(self.silence.calibration_secs),
            cycles(self.silence.grace_secs),
            cycles(self.silence.min_silence_secs),
            self.silence.margin_db,
        ))
    }
}
