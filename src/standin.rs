/// Energy-based stand-in models
///
/// Real WakeNet/MultiNet models are vendor blobs behind the engine
/// contract. These stand-ins let the service run end to end without them:
/// a wake word is any confirmed speech onset, and a command is the number
/// of energy bursts in the following utterance. The burst transcriber
/// spells that number out for the phrase matcher.

use crate::adapter::{RecognizerFactory, Spot, WakeSpotter};
use crate::engine::{CommandEngine, CommandMatch, CommandOutcome, EngineError, WakeState};
use crate::frame::{Frame, Sample};
use crate::models::MULTINET_PREFIX;
use crate::phrases::Transcriber;
use crate::vad::{VadConfig, VadGate, VadState};
use tracing::{debug, trace};

/// Wake spotter that fires on speech onset, one gate per channel
pub struct EnergySpotter {
    gates: Vec<VadGate>,
    model_index: usize,
    word_index: usize,
    armed: bool,
    pending_verify: Option<usize>,
}

impl EnergySpotter {
    pub fn new(channels: u16, vad_config: VadConfig) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            gates: vec![VadGate::with_config(vad_config); channels],
            model_index: 0,
            word_index: 0,
            armed: true,
            pending_verify: None,
        }
    }

    /// Indices reported with every detection
    pub fn with_indices(mut self, model_index: usize, word_index: usize) -> Self {
        self.model_index = model_index;
        self.word_index = word_index;
        self
    }

    fn spot_of(&self, wake_state: WakeState, trigger_channel: Option<usize>) -> Spot {
        Spot {
            wake_state,
            model_index: self.model_index,
            word_index: self.word_index,
            trigger_channel,
        }
    }
}

impl WakeSpotter for EnergySpotter {
    fn spot(&mut self, frame: &Frame) -> Result<Spot, EngineError> {
        let stride = self.gates.len();
        if frame.channels() as usize != stride {
            return Err(EngineError::Fault(format!(
                "spotter built for {} channel(s), frame has {}",
                stride,
                frame.channels()
            )));
        }

        // Verification always lands on the frame after the detection
        if let Some(channel) = self.pending_verify.take() {
            return Ok(self.spot_of(WakeState::ChannelVerified, Some(channel)));
        }

        let mut loudest: Option<(usize, f32)> = None;
        for (channel, gate) in self.gates.iter_mut().enumerate() {
            let (active, level) = gate.process_channel(frame.samples(), channel, stride);
            if active && loudest.map_or(true, |(_, rms)| level.rms > rms) {
                loudest = Some((channel, level.rms));
            }
        }

        let Some((channel, rms)) = loudest else {
            self.armed = true;
            return Ok(Spot::default());
        };

        if !self.armed {
            return Ok(Spot::default());
        }
        self.armed = false;

        debug!("Speech onset on channel {} (rms {:.3})", channel, rms);
        if stride > 1 {
            self.pending_verify = Some(channel);
            Ok(self.spot_of(WakeState::Detected, Some(channel)))
        } else {
            Ok(self.spot_of(WakeState::Detected, None))
        }
    }

    fn reset(&mut self) {
        for gate in &mut self.gates {
            gate.reset();
        }
        self.armed = true;
        self.pending_verify = None;
    }
}

/// Energy bursts in one utterance, closed by the VAD hangover
#[derive(Debug, Clone)]
struct BurstCounter {
    gate: VadGate,
    bursts: u32,
    loud: bool,
    heard_speech: bool,
    peak_rms: f32,
}

impl BurstCounter {
    fn new(vad_config: VadConfig) -> Self {
        Self {
            gate: VadGate::with_config(vad_config),
            bursts: 0,
            loud: false,
            heard_speech: false,
            peak_rms: 0.0,
        }
    }

    /// Advance one chunk; returns burst count and peak RMS once the utterance ended
    fn push(&mut self, samples: &[Sample]) -> Option<(u32, f32)> {
        let (active, level) = self.gate.process_channel(samples, 0, 1);

        let loud = level.rms > self.gate.config().energy_threshold;
        if loud && !self.loud {
            self.bursts += 1;
            trace!("Burst {} started", self.bursts);
        }
        self.loud = loud;
        self.peak_rms = self.peak_rms.max(level.rms);

        if active {
            self.heard_speech = true;
            return None;
        }

        if self.gate.state() == VadState::Silence {
            if self.heard_speech {
                return Some((self.bursts.max(1), self.peak_rms));
            }
            // A blip that never became speech
            self.bursts = 0;
            self.peak_rms = 0.0;
        }
        None
    }

    fn reset(&mut self) {
        self.gate.reset();
        self.bursts = 0;
        self.loud = false;
        self.heard_speech = false;
        self.peak_rms = 0.0;
    }
}

/// Command recognizer that counts energy bursts in one utterance
pub struct BurstRecognizer {
    counter: BurstCounter,
}

impl BurstRecognizer {
    pub fn new(vad_config: VadConfig) -> Self {
        Self {
            counter: BurstCounter::new(vad_config),
        }
    }
}

impl CommandEngine for BurstRecognizer {
    fn detect(&mut self, samples: &[Sample]) -> CommandOutcome {
        match self.counter.push(samples) {
            Some((bursts, peak_rms)) => CommandOutcome::Detected(vec![CommandMatch {
                command_id: bursts,
                phrase_id: 0,
                confidence: (peak_rms * 4.0).min(1.0),
                transcript: format!("{} burst(s)", bursts),
            }]),
            None => CommandOutcome::Detecting,
        }
    }

    fn reset(&mut self) {
        self.counter.reset();
    }

    fn partial_transcript(&self) -> String {
        match self.counter.bursts {
            0 => String::new(),
            n => format!("{} burst(s) so far", n),
        }
    }
}

/// Spelled-out burst count, e.g. "two bursts"
pub fn burst_words(bursts: u32) -> String {
    const NUMBERS: [&str; 11] = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    ];
    let unit = if bursts == 1 { "burst" } else { "bursts" };
    match NUMBERS.get(bursts as usize) {
        Some(word) => format!("{} {}", word, unit),
        None => format!("{} {}", bursts, unit),
    }
}

/// Transcriber that "hears" the burst count of each utterance as words,
/// so phrases like "two bursts" can be matched without a speech model
pub struct BurstTranscriber {
    counter: BurstCounter,
}

impl BurstTranscriber {
    pub fn new(vad_config: VadConfig) -> Self {
        Self {
            counter: BurstCounter::new(vad_config),
        }
    }
}

impl Transcriber for BurstTranscriber {
    fn accept(&mut self, samples: &[Sample]) -> Option<String> {
        let (bursts, _) = self.counter.push(samples)?;
        self.counter.reset();
        let heard = burst_words(bursts);
        debug!("Transcribed utterance: '{}'", heard);
        Some(heard)
    }

    fn partial(&self) -> String {
        match self.counter.bursts {
            0 => String::new(),
            n => burst_words(n),
        }
    }

    fn reset(&mut self) {
        self.counter.reset();
    }
}

/// Hands out burst recognizers for any MultiNet-prefixed model name
pub struct BurstRecognizerFactory {
    vad_config: VadConfig,
}

impl BurstRecognizerFactory {
    pub fn new(vad_config: VadConfig) -> Self {
        Self { vad_config }
    }
}

impl RecognizerFactory for BurstRecognizerFactory {
    type Recognizer = BurstRecognizer;

    fn create(&self, name: &str) -> Option<BurstRecognizer> {
        name.starts_with(MULTINET_PREFIX)
            .then(|| BurstRecognizer::new(self.vad_config.clone()))
    }
}
