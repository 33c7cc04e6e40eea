/// Voice Activity Detection (VAD) module
///
/// Energy plus zero-crossing-rate gate with hysteresis. Works on one
/// channel of an interleaved frame at a time, so multi-mic frames never
/// need to be copied apart. Feeds the `vad` flag of every fetch result and
/// drives the stand-in energy models.

use crate::frame::Sample;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum VadError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// VAD configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold for a speech frame (0.0 - 1.0 of full scale)
    pub energy_threshold: f32,

    /// Zero-crossing rate threshold for a speech frame
    pub zcr_threshold: f32,

    /// Consecutive speech frames needed to confirm speech
    pub speech_frames_required: usize,

    /// Consecutive silent frames needed to end speech
    pub silence_frames_required: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            zcr_threshold: 0.05,
            speech_frames_required: 3,   // ~96ms at 512-sample chunks
            silence_frames_required: 10, // ~320ms
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<(), VadError> {
        if !(0.0..=1.0).contains(&self.energy_threshold) {
            return Err(VadError::InvalidConfig(
                "energy_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.zcr_threshold) {
            return Err(VadError::InvalidConfig(
                "zcr_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.speech_frames_required == 0 || self.silence_frames_required == 0 {
            return Err(VadError::InvalidConfig(
                "frame counts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    /// Speech seen, waiting for confirmation
    MaybeSpeech,
    Speech,
    /// Silence seen during speech, waiting for confirmation
    MaybeSilence,
}

/// Loudness summary of one channel of one frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameLevel {
    pub rms: f32,
    pub zcr: f32,
}

/// Measure channel `channel` of an interleaved buffer with `stride` channels
pub fn measure(samples: &[Sample], channel: usize, stride: usize) -> FrameLevel {
    let stride = stride.max(1);
    let mut count = 0usize;
    let mut sum_squares = 0.0f64;
    let mut crossings = 0usize;
    let mut prev: Option<Sample> = None;

    for &s in samples.iter().skip(channel).step_by(stride) {
        let normalized = s as f64 / i16::MAX as f64;
        sum_squares += normalized * normalized;

        if let Some(p) = prev {
            if (p >= 0) != (s >= 0) {
                crossings += 1;
            }
        }
        prev = Some(s);
        count += 1;
    }

    if count == 0 {
        return FrameLevel::default();
    }

    FrameLevel {
        rms: (sum_squares / count as f64).sqrt() as f32,
        zcr: if count > 1 {
            crossings as f32 / (count - 1) as f32
        } else {
            0.0
        },
    }
}

/// Hysteresis gate over per-frame speech decisions
#[derive(Debug, Clone)]
pub struct VadGate {
    config: VadConfig,
    state: VadState,
    speech_run: usize,
    silence_run: usize,
}

impl VadGate {
    pub fn new() -> Self {
        Self::with_config(VadConfig::default())
    }

    pub fn with_config(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Silence,
            speech_run: 0,
            silence_run: 0,
        }
    }

    /// Classify channel `channel` of an interleaved chunk and advance the gate.
    ///
    /// Returns whether speech is active and the measured level.
    pub fn process_channel(
        &mut self,
        samples: &[Sample],
        channel: usize,
        stride: usize,
    ) -> (bool, FrameLevel) {
        let level = measure(samples, channel, stride);
        let is_speech_frame =
            level.rms > self.config.energy_threshold && level.zcr > self.config.zcr_threshold;

        trace!(
            "Frame analysis: rms={:.4}, zcr={:.4}, state={:?}",
            level.rms, level.zcr, self.state
        );

        self.advance(is_speech_frame);
        (self.is_speech_active(), level)
    }

    fn advance(&mut self, is_speech_frame: bool) {
        let next = match (self.state, is_speech_frame) {
            (VadState::Silence, true) => {
                self.speech_run = 1;
                if self.speech_run >= self.config.speech_frames_required {
                    VadState::Speech
                } else {
                    VadState::MaybeSpeech
                }
            }
            (VadState::Silence, false) => VadState::Silence,
            (VadState::MaybeSpeech, true) => {
                self.speech_run += 1;
                if self.speech_run >= self.config.speech_frames_required {
                    VadState::Speech
                } else {
                    VadState::MaybeSpeech
                }
            }
            (VadState::MaybeSpeech, false) => {
                self.speech_run = 0;
                VadState::Silence
            }
            (VadState::Speech, true) => VadState::Speech,
            (VadState::Speech, false) | (VadState::MaybeSilence, false) => {
                self.silence_run += 1;
                if self.silence_run >= self.config.silence_frames_required {
                    self.speech_run = 0;
                    VadState::Silence
                } else {
                    VadState::MaybeSilence
                }
            }
            (VadState::MaybeSilence, true) => VadState::Speech,
        };

        if next != VadState::MaybeSilence {
            self.silence_run = 0;
        }
        if next != self.state {
            debug!("VAD: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    pub fn is_speech_active(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::MaybeSilence)
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_run = 0;
        self.silence_run = 0;
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

impl Default for VadGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Floor of [`rms_dbfs`], reported for empty or digital-silence frames
pub const DBFS_FLOOR: f32 = -120.0;

/// Silence threshold used when no calibration frames were seen
const UNCALIBRATED_THRESHOLD_DB: f32 = -60.0;
const MIN_THRESHOLD_DB: f32 = -90.0;
const MAX_THRESHOLD_DB: f32 = -10.0;

/// RMS level of all samples in dB relative to full scale
pub fn rms_dbfs(samples: &[Sample]) -> f32 {
    if samples.is_empty() {
        return DBFS_FLOOR;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / 32768.0;
            normalized * normalized
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64 + 1e-12).sqrt();
    ((20.0 * rms.log10()) as f32).max(DBFS_FLOOR)
}

/// Prolonged-silence monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    pub enabled: bool,

    /// Ambient audio measured at startup to place the threshold
    pub calibration_secs: f32,

    /// Threshold sits this far below the ambient median
    pub margin_db: f32,

    /// Continuous silence that raises a silence timeout
    pub min_silence_secs: f32,

    /// No timeout is raised this soon after startup
    pub grace_secs: f32,

    /// Stop the service when the timeout fires
    pub stop_on_timeout: bool,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            calibration_secs: 3.0,
            margin_db: 3.0,
            min_silence_secs: 30.0,
            grace_secs: 20.0,
            stop_on_timeout: true,
        }
    }
}

impl SilenceConfig {
    pub fn validate(&self) -> Result<(), VadError> {
        let durations = [self.calibration_secs, self.min_silence_secs, self.grace_secs];
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(VadError::InvalidConfig(
                "silence durations must be non-negative".to_string(),
            ));
        }

        if self.enabled && self.min_silence_secs <= 0.0 {
            return Err(VadError::InvalidConfig(
                "min_silence_secs must be greater than 0".to_string(),
            ));
        }

        if !self.margin_db.is_finite() || self.margin_db < 0.0 {
            return Err(VadError::InvalidConfig(
                "margin_db must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

/// Ambient median minus `margin_db`, clamped to [-90, -10] dBFS
pub fn calibrated_threshold(levels: &mut [f32], margin_db: f32) -> f32 {
    if levels.is_empty() {
        return UNCALIBRATED_THRESHOLD_DB;
    }
    levels.sort_by(f32::total_cmp);
    let mid = levels.len() / 2;
    let median = if levels.len() % 2 == 0 {
        (levels[mid - 1] + levels[mid]) / 2.0
    } else {
        levels[mid]
    };
    (median - margin_db).clamp(MIN_THRESHOLD_DB, MAX_THRESHOLD_DB)
}

/// Watches frame levels for prolonged silence.
///
/// Windows are counted in frames. The first `calibration_frames` frames set
/// the threshold; the grace period runs from the first frame.
#[derive(Debug, Clone)]
pub struct SilenceMonitor {
    calibration_frames: u64,
    grace_frames: u64,
    min_silence_frames: u64,
    margin_db: f32,
    ambient: Vec<f32>,
    threshold_db: Option<f32>,
    frames: u64,
    last_loud: u64,
    fired: bool,
}

impl SilenceMonitor {
    pub fn new(
        calibration_frames: u64,
        grace_frames: u64,
        min_silence_frames: u64,
        margin_db: f32,
    ) -> Self {
        Self {
            calibration_frames,
            grace_frames,
            min_silence_frames: min_silence_frames.max(1),
            margin_db,
            ambient: Vec::with_capacity(calibration_frames as usize),
            threshold_db: None,
            frames: 0,
            last_loud: 0,
            fired: false,
        }
    }

    /// Calibrated threshold, once calibration is over
    pub fn threshold_db(&self) -> Option<f32> {
        self.threshold_db
    }

    /// Account one frame; returns the silent frame count when a timeout fires.
    ///
    /// Fires once per silent stretch and re-arms on the next loud frame.
    pub fn observe(&mut self, samples: &[Sample]) -> Option<u64> {
        self.frames += 1;
        let level = rms_dbfs(samples);

        let threshold = match self.threshold_db {
            Some(threshold) => threshold,
            None if self.frames <= self.calibration_frames => {
                self.ambient.push(level);
                if self.frames == self.calibration_frames {
                    self.finish_calibration();
                }
                return None;
            }
            None => self.finish_calibration(),
        };

        if level > threshold {
            self.last_loud = self.frames;
            self.fired = false;
        }

        if self.frames <= self.grace_frames || self.fired {
            return None;
        }

        let silent = self.frames - self.last_loud;
        if silent >= self.min_silence_frames {
            self.fired = true;
            return Some(silent);
        }
        None
    }

    fn finish_calibration(&mut self) -> f32 {
        let threshold = calibrated_threshold(&mut self.ambient, self.margin_db);
        info!(
            "Silence threshold calibrated at {:.1} dBFS from {} frame(s)",
            threshold,
            self.ambient.len()
        );
        self.ambient = Vec::new();
        self.threshold_db = Some(threshold);
        threshold
    }
}
