/// Pipeline controller: the detection-phase state machine
///
/// Consumes one fetch result per cycle and decides whether the wake
/// spotter or the command recognizer is authoritative. Capture never sees
/// any of this; feed keeps running regardless of the phase.
///
/// ```text
///   LISTENING ──DETECTED (mono)──────────────► COMMAND_ACTIVE
///   LISTENING ──DETECTED (multi)──► CHANNEL_VERIFY
///   CHANNEL_VERIFY ──CHANNEL_VERIFIED (same channel)──► COMMAND_ACTIVE
///   CHANNEL_VERIFY ──window elapsed──► LISTENING
///   COMMAND_ACTIVE ──DETECTED / TIMEOUT──► LISTENING
/// ```
///
/// Both windows are counted in fetch cycles. Every exit from
/// COMMAND_ACTIVE re-enables wake detection and clears the recognizer.

use crate::engine::{
    rank_matches, CommandEngine, CommandOutcome, DetectionEngine, FetchResult, WakeState,
};
use crate::events::EventSink;
use crate::frame::Sample;
use tracing::{debug, info, trace, warn};

/// Detection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Listening,
    ChannelVerify,
    CommandActive,
}

/// Window lengths, in fetch cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub verify_timeout_cycles: u64,
    pub command_timeout_cycles: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            verify_timeout_cycles: 32,
            command_timeout_cycles: 150,
        }
    }
}

/// Counters for the run report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub cycles: u64,
    pub wake_events: u64,
    pub verify_discards: u64,
    pub commands_recognized: u64,
    pub command_timeouts: u64,
}

/// Wake detection awaiting channel verification
#[derive(Debug, Clone, Copy)]
struct PendingWake {
    model_index: usize,
    word_index: usize,
    trigger_channel: Option<usize>,
    since_cycle: u64,
}

pub struct PipelineController<'e, E: DetectionEngine> {
    engine: &'e E,
    recognizer: E::Recognizer,
    config: ControllerConfig,
    state: PipelineState,
    multi_channel: bool,
    channels: usize,
    pending: Option<PendingWake>,
    command_channel: usize,
    command_since: u64,
    wake_armed: bool,
    scratch: Vec<Sample>,
    stats: ControllerStats,
}

impl<'e, E: DetectionEngine> PipelineController<'e, E> {
    /// Start in LISTENING with wake detection enabled
    pub fn new(engine: &'e E, recognizer: E::Recognizer, config: ControllerConfig) -> Self {
        let multi_channel = engine.is_multi_channel();
        engine.enable_wake_detection(true);

        debug!(
            "Controller ready: multi_channel={}, verify window={} cycles, command window={} cycles",
            multi_channel, config.verify_timeout_cycles, config.command_timeout_cycles
        );

        Self {
            engine,
            recognizer,
            config,
            state: PipelineState::Listening,
            multi_channel,
            channels: engine.feed_channels() as usize,
            pending: None,
            command_channel: 0,
            command_since: 0,
            wake_armed: true,
            // Sized once so the command path never allocates per cycle
            scratch: vec![0; engine.feed_chunk_size()],
            stats: ControllerStats::default(),
        }
    }

    /// Advance one fetch cycle and return the resulting state
    pub fn step<S: EventSink + ?Sized>(
        &mut self,
        result: &FetchResult,
        sink: &mut S,
    ) -> PipelineState {
        self.stats.cycles += 1;
        let cycle = self.stats.cycles;

        match self.state {
            PipelineState::Listening => self.on_listening(result, cycle, sink),
            PipelineState::ChannelVerify => self.on_channel_verify(result, cycle, sink),
            PipelineState::CommandActive => self.on_command_active(result, cycle, sink),
        }

        self.state
    }

    fn on_listening<S: EventSink + ?Sized>(
        &mut self,
        result: &FetchResult,
        cycle: u64,
        sink: &mut S,
    ) {
        match result.wake_state {
            WakeState::Detected if self.multi_channel => {
                debug!(
                    "Wake candidate at cycle {} (trigger channel {:?}), verifying",
                    cycle, result.trigger_channel
                );
                self.pending = Some(PendingWake {
                    model_index: result.model_index,
                    word_index: result.word_index,
                    trigger_channel: result.trigger_channel,
                    since_cycle: cycle,
                });
                self.state = PipelineState::ChannelVerify;
            }
            WakeState::Detected => {
                self.enter_command(result.model_index, result.word_index, None, cycle, sink);
            }
            WakeState::ChannelVerified => {
                trace!("Ignoring channel verification with no pending wake at cycle {}", cycle);
            }
            WakeState::None => {}
        }
    }

    fn on_channel_verify<S: EventSink + ?Sized>(
        &mut self,
        result: &FetchResult,
        cycle: u64,
        sink: &mut S,
    ) {
        let Some(pending) = self.pending else {
            warn!("Channel verification state without a pending wake, back to listening");
            self.state = PipelineState::Listening;
            return;
        };

        if result.wake_state == WakeState::ChannelVerified {
            let matches = match (pending.trigger_channel, result.trigger_channel) {
                (Some(expected), Some(actual)) => expected == actual,
                (None, Some(_)) => true,
                (_, None) => false,
            };
            let in_range = result
                .trigger_channel
                .is_some_and(|channel| channel < self.channels);

            if matches && !in_range {
                warn!(
                    "Verified channel {:?} outside the {} fed channels, ignoring",
                    result.trigger_channel, self.channels
                );
            } else if matches {
                self.pending = None;
                self.enter_command(
                    pending.model_index,
                    pending.word_index,
                    result.trigger_channel,
                    cycle,
                    sink,
                );
                return;
            }

            debug!(
                "Verified channel {:?} does not match trigger {:?}, ignoring",
                result.trigger_channel, pending.trigger_channel
            );
        }

        if cycle - pending.since_cycle >= self.config.verify_timeout_cycles {
            info!(
                "Channel verification window elapsed after {} cycles, discarding wake",
                cycle - pending.since_cycle
            );
            self.pending = None;
            self.stats.verify_discards += 1;
            self.state = PipelineState::Listening;
        }
    }

    fn on_command_active<S: EventSink + ?Sized>(
        &mut self,
        result: &FetchResult,
        cycle: u64,
        sink: &mut S,
    ) {
        let outcome = match &result.frame {
            Some(frame) if frame.channels() > 1 => {
                let written = frame.copy_channel(self.command_channel, &mut self.scratch);
                self.recognizer.detect(&self.scratch[..written])
            }
            Some(frame) => self.recognizer.detect(frame.samples()),
            None => CommandOutcome::Detecting,
        };

        match outcome {
            CommandOutcome::Detected(mut matches) => {
                rank_matches(&mut matches);
                if let Some(best) = matches.first() {
                    info!(
                        "Command {} recognized at cycle {} (confidence {:.2})",
                        best.command_id, cycle, best.confidence
                    );
                }
                self.stats.commands_recognized += 1;
                sink.on_command_recognized(&matches);
                self.exit_command();
            }
            CommandOutcome::Timeout { partial } => {
                info!("Recognizer timed out at cycle {}", cycle);
                self.stats.command_timeouts += 1;
                sink.on_command_timeout(&partial);
                self.exit_command();
            }
            CommandOutcome::Detecting => {
                if cycle - self.command_since >= self.config.command_timeout_cycles {
                    info!(
                        "Command window of {} cycles elapsed at cycle {}",
                        self.config.command_timeout_cycles, cycle
                    );
                    let partial = self.recognizer.partial_transcript();
                    self.stats.command_timeouts += 1;
                    sink.on_command_timeout(&partial);
                    self.exit_command();
                }
            }
        }
    }

    fn enter_command<S: EventSink + ?Sized>(
        &mut self,
        model_index: usize,
        word_index: usize,
        channel: Option<usize>,
        cycle: u64,
        sink: &mut S,
    ) {
        self.set_wake(false);
        self.recognizer.reset();
        self.command_channel = channel.unwrap_or(0);
        self.command_since = cycle;
        self.stats.wake_events += 1;
        self.state = PipelineState::CommandActive;

        info!(
            "Wake word detected at cycle {}: model={}, word={}, channel={:?}",
            cycle, model_index, word_index, channel
        );
        sink.on_wake_detected(model_index, word_index, channel);
    }

    /// Shared by the recognized and timeout paths
    fn exit_command(&mut self) {
        self.set_wake(true);
        self.recognizer.reset();
        self.state = PipelineState::Listening;
    }

    fn set_wake(&mut self, enabled: bool) {
        self.engine.enable_wake_detection(enabled);
        self.wake_armed = enabled;
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether the controller last left wake detection enabled
    pub fn wake_armed(&self) -> bool {
        self.wake_armed
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommandMatch, EngineError, MockCommandEngine};
    use crate::events::{MockEventSink, PipelineEvent};
    use crate::frame::Frame;
    use mockall::predicate::eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const CHUNK: usize = 8;

    /// Engine stub that only records wake toggles; feed/fetch are driven by hand
    struct ToggleEngine {
        channels: u16,
        toggles: Mutex<Vec<bool>>,
    }

    impl ToggleEngine {
        fn new(channels: u16) -> Self {
            Self {
                channels,
                toggles: Mutex::new(Vec::new()),
            }
        }

        fn toggles(&self) -> Vec<bool> {
            self.toggles.lock().unwrap().clone()
        }
    }

    impl DetectionEngine for ToggleEngine {
        type Recognizer = ScriptedRecognizer;

        fn feed_chunk_size(&self) -> usize {
            CHUNK
        }

        fn feed_channels(&self) -> u16 {
            self.channels
        }

        fn feed(&self, _frame: Frame) -> Result<(), EngineError> {
            Ok(())
        }

        fn fetch(&self, _timeout: Duration) -> Result<Option<FetchResult>, EngineError> {
            Ok(None)
        }

        fn enable_wake_detection(&self, enabled: bool) {
            self.toggles.lock().unwrap().push(enabled);
        }

        fn create_command_recognizer(
            &self,
            _name: &str,
        ) -> Result<ScriptedRecognizer, EngineError> {
            Ok(ScriptedRecognizer::default())
        }
    }

    /// Returns queued outcomes, then Detecting forever
    #[derive(Default)]
    struct ScriptedRecognizer {
        script: VecDeque<(u64, CommandOutcome)>,
        calls: u64,
        resets: u64,
        last_samples: Vec<Sample>,
    }

    impl ScriptedRecognizer {
        /// Return `outcome` on the `call`-th detect after the latest reset
        fn on_call(mut self, call: u64, outcome: CommandOutcome) -> Self {
            self.script.push_back((call, outcome));
            self
        }
    }

    impl CommandEngine for ScriptedRecognizer {
        fn detect(&mut self, samples: &[Sample]) -> CommandOutcome {
            self.calls += 1;
            self.last_samples = samples.to_vec();
            match self.script.front() {
                Some((call, _)) if *call == self.calls => self.script.pop_front().unwrap().1,
                _ => CommandOutcome::Detecting,
            }
        }

        fn reset(&mut self) {
            self.calls = 0;
            self.resets += 1;
        }

        fn partial_transcript(&self) -> String {
            "turn on the".to_string()
        }
    }

    fn silent() -> FetchResult {
        FetchResult::with_frame(Frame::new(CHUNK, 1))
    }

    fn wake(state: WakeState, channel: Option<usize>) -> FetchResult {
        FetchResult {
            wake_state: state,
            model_index: 0,
            word_index: 1,
            trigger_channel: channel,
            ..silent()
        }
    }

    fn hypothesis(command_id: u32, confidence: f32) -> CommandMatch {
        CommandMatch {
            command_id,
            phrase_id: 0,
            confidence,
            transcript: format!("command {}", command_id),
        }
    }

    /// Run `results` through the controller, one per cycle
    fn drive<E: DetectionEngine>(
        controller: &mut PipelineController<'_, E>,
        sink: &mut Vec<PipelineEvent>,
        cycles: u64,
        mut result_at: impl FnMut(u64) -> FetchResult,
    ) -> Vec<PipelineState> {
        (1..=cycles)
            .map(|cycle| controller.step(&result_at(cycle), sink))
            .collect()
    }

    #[test]
    fn test_single_channel_wake_then_command() {
        let engine = ToggleEngine::new(1);
        let recognizer = ScriptedRecognizer::default()
            .on_call(15, CommandOutcome::Detected(vec![hypothesis(3, 0.8)]));
        let mut controller =
            PipelineController::new(&engine, recognizer, ControllerConfig::default());
        let mut sink = Vec::new();

        let states = drive(&mut controller, &mut sink, 30, |cycle| {
            if cycle == 10 {
                wake(WakeState::Detected, None)
            } else {
                silent()
            }
        });

        assert_eq!(states[8], PipelineState::Listening);
        assert_eq!(states[9], PipelineState::CommandActive);
        assert_eq!(states[23], PipelineState::CommandActive);
        assert_eq!(states[24], PipelineState::Listening);
        assert_eq!(
            sink,
            vec![
                PipelineEvent::WakeDetected {
                    model_index: 0,
                    word_index: 1,
                    channel: None
                },
                PipelineEvent::CommandRecognized(vec![hypothesis(3, 0.8)]),
            ]
        );

        // Initial arm, disable on entry, re-enable on exit
        assert_eq!(engine.toggles(), vec![true, false, true]);
        assert!(controller.wake_armed());
        assert_eq!(controller.stats().commands_recognized, 1);
    }

    #[test]
    fn test_command_window_times_out() {
        let engine = ToggleEngine::new(1);
        let mut controller = PipelineController::new(
            &engine,
            ScriptedRecognizer::default(),
            ControllerConfig {
                verify_timeout_cycles: 32,
                command_timeout_cycles: 150,
            },
        );
        let mut sink = Vec::new();

        let states = drive(&mut controller, &mut sink, 170, |cycle| {
            if cycle == 10 {
                wake(WakeState::Detected, None)
            } else {
                silent()
            }
        });

        assert_eq!(states[158], PipelineState::CommandActive);
        assert_eq!(states[159], PipelineState::Listening);
        assert_eq!(
            sink.last(),
            Some(&PipelineEvent::CommandTimeout {
                partial_transcript: "turn on the".to_string()
            })
        );
        assert_eq!(engine.toggles(), vec![true, false, true]);
        assert_eq!(controller.stats().command_timeouts, 1);
    }

    #[test]
    fn test_recognizer_timeout_rearms_wake() {
        let engine = ToggleEngine::new(1);
        let recognizer = ScriptedRecognizer::default().on_call(
            2,
            CommandOutcome::Timeout {
                partial: "open".to_string(),
            },
        );
        let mut controller =
            PipelineController::new(&engine, recognizer, ControllerConfig::default());
        let mut sink = Vec::new();

        drive(&mut controller, &mut sink, 5, |cycle| {
            if cycle == 1 {
                wake(WakeState::Detected, None)
            } else {
                silent()
            }
        });

        assert_eq!(controller.state(), PipelineState::Listening);
        assert_eq!(
            sink.last(),
            Some(&PipelineEvent::CommandTimeout {
                partial_transcript: "open".to_string()
            })
        );
        assert_eq!(engine.toggles(), vec![true, false, true]);
    }

    #[test]
    fn test_multi_channel_verification_discard() {
        let engine = ToggleEngine::new(2);
        let mut controller = PipelineController::new(
            &engine,
            ScriptedRecognizer::default(),
            ControllerConfig {
                verify_timeout_cycles: 20,
                command_timeout_cycles: 150,
            },
        );
        let mut sink = Vec::new();

        let states = drive(&mut controller, &mut sink, 40, |cycle| {
            if cycle == 5 {
                wake(WakeState::Detected, Some(1))
            } else {
                silent()
            }
        });

        assert_eq!(states[4], PipelineState::ChannelVerify);
        assert_eq!(states[23], PipelineState::ChannelVerify);
        assert_eq!(states[24], PipelineState::Listening);
        assert!(sink.is_empty());
        // Wake detection was never touched past the initial arm
        assert_eq!(engine.toggles(), vec![true]);
        assert_eq!(controller.stats().verify_discards, 1);
    }

    #[test]
    fn test_multi_channel_verification_success() {
        let engine = ToggleEngine::new(2);
        let mut controller = PipelineController::new(
            &engine,
            ScriptedRecognizer::default(),
            ControllerConfig::default(),
        );
        let mut sink = Vec::new();

        drive(&mut controller, &mut sink, 8, |cycle| match cycle {
            3 => wake(WakeState::Detected, Some(1)),
            4 => wake(WakeState::ChannelVerified, Some(0)),
            6 => wake(WakeState::ChannelVerified, Some(1)),
            _ => silent(),
        });

        assert_eq!(controller.state(), PipelineState::CommandActive);
        assert_eq!(
            sink,
            vec![PipelineEvent::WakeDetected {
                model_index: 0,
                word_index: 1,
                channel: Some(1)
            }]
        );
        assert_eq!(engine.toggles(), vec![true, false]);
        assert!(!controller.wake_armed());
    }

    #[test]
    fn test_verified_without_channel_is_rejected() {
        let engine = ToggleEngine::new(2);
        let mut controller = PipelineController::new(
            &engine,
            ScriptedRecognizer::default(),
            ControllerConfig::default(),
        );
        let mut sink = Vec::new();

        drive(&mut controller, &mut sink, 4, |cycle| match cycle {
            1 => wake(WakeState::Detected, Some(0)),
            2 => wake(WakeState::ChannelVerified, None),
            _ => silent(),
        });

        assert_eq!(controller.state(), PipelineState::ChannelVerify);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_verified_channel_out_of_range_is_rejected() {
        let engine = ToggleEngine::new(2);
        let config = ControllerConfig {
            verify_timeout_cycles: 4,
            ..ControllerConfig::default()
        };
        let mut controller =
            PipelineController::new(&engine, ScriptedRecognizer::default(), config);
        let mut sink = Vec::new();

        let states = drive(&mut controller, &mut sink, 5, |cycle| match cycle {
            1 => wake(WakeState::Detected, Some(2)),
            2 => wake(WakeState::ChannelVerified, Some(2)),
            _ => silent(),
        });

        assert_eq!(states[1], PipelineState::ChannelVerify);
        assert_eq!(states[4], PipelineState::Listening);
        assert!(sink.is_empty());
        assert_eq!(controller.stats().verify_discards, 1);
        assert_eq!(engine.toggles(), vec![true]);
    }

    #[test]
    fn test_command_recognizer_hears_verified_channel() {
        let engine = ToggleEngine::new(2);
        let mut controller = PipelineController::new(
            &engine,
            ScriptedRecognizer::default(),
            ControllerConfig::default(),
        );
        let mut sink = Vec::new();

        controller.step(&wake(WakeState::Detected, Some(1)), &mut sink);
        controller.step(&wake(WakeState::ChannelVerified, Some(1)), &mut sink);

        let mut frame = Frame::new(CHUNK, 2);
        for (i, s) in frame.samples_mut().iter_mut().enumerate() {
            *s = if i % 2 == 1 { 100 } else { -100 };
        }
        controller.step(&FetchResult::with_frame(frame), &mut sink);

        assert_eq!(controller.recognizer.last_samples, vec![100; CHUNK]);
    }

    #[test]
    fn test_detected_results_are_ranked() {
        let engine = ToggleEngine::new(1);
        let recognizer = ScriptedRecognizer::default().on_call(
            1,
            CommandOutcome::Detected(vec![hypothesis(1, 0.3), hypothesis(2, 0.7)]),
        );
        let mut controller =
            PipelineController::new(&engine, recognizer, ControllerConfig::default());
        let mut sink = Vec::new();

        controller.step(&wake(WakeState::Detected, None), &mut sink);
        controller.step(&silent(), &mut sink);

        assert_eq!(
            sink.last(),
            Some(&PipelineEvent::CommandRecognized(vec![
                hypothesis(2, 0.7),
                hypothesis(1, 0.3)
            ]))
        );
    }

    #[test]
    fn test_wake_ignored_during_command() {
        let engine = ToggleEngine::new(1);
        let mut controller = PipelineController::new(
            &engine,
            ScriptedRecognizer::default(),
            ControllerConfig::default(),
        );
        let mut sink = Vec::new();

        controller.step(&wake(WakeState::Detected, None), &mut sink);
        controller.step(&wake(WakeState::Detected, None), &mut sink);
        controller.step(&wake(WakeState::Detected, None), &mut sink);

        assert_eq!(controller.state(), PipelineState::CommandActive);
        assert_eq!(sink.len(), 1);
        assert_eq!(controller.stats().wake_events, 1);
    }

    #[test]
    fn test_recognizer_reset_on_entry_and_exit() {
        let engine = ToggleEngine::new(1);
        let recognizer = ScriptedRecognizer::default()
            .on_call(1, CommandOutcome::Detected(vec![hypothesis(4, 0.9)]));
        let mut controller =
            PipelineController::new(&engine, recognizer, ControllerConfig::default());
        let mut sink = Vec::new();

        controller.step(&wake(WakeState::Detected, None), &mut sink);
        assert_eq!(controller.recognizer.resets, 1);

        controller.step(&silent(), &mut sink);
        assert_eq!(controller.recognizer.resets, 2);
        assert_eq!(controller.state(), PipelineState::Listening);
    }

    #[test]
    fn test_sink_calls_with_mock() {
        let engine = ToggleEngine::new(1);
        let mut recognizer = MockCommandEngine::new();
        recognizer.expect_reset().times(2).return_const(());
        recognizer
            .expect_detect()
            .times(1)
            .returning(|_| CommandOutcome::Detected(vec![hypothesis(7, 0.6)]));

        struct MockEngine(ToggleEngine);
        impl DetectionEngine for MockEngine {
            type Recognizer = MockCommandEngine;
            fn feed_chunk_size(&self) -> usize {
                self.0.feed_chunk_size()
            }
            fn feed_channels(&self) -> u16 {
                1
            }
            fn feed(&self, frame: Frame) -> Result<(), EngineError> {
                self.0.feed(frame)
            }
            fn fetch(&self, timeout: Duration) -> Result<Option<FetchResult>, EngineError> {
                self.0.fetch(timeout)
            }
            fn enable_wake_detection(&self, enabled: bool) {
                self.0.enable_wake_detection(enabled)
            }
            fn create_command_recognizer(
                &self,
                _name: &str,
            ) -> Result<MockCommandEngine, EngineError> {
                Ok(MockCommandEngine::new())
            }
        }

        let engine = MockEngine(engine);
        let mut controller =
            PipelineController::new(&engine, recognizer, ControllerConfig::default());

        let mut sink = MockEventSink::new();
        sink.expect_on_wake_detected()
            .with(eq(0), eq(1), eq(None))
            .times(1)
            .return_const(());
        sink.expect_on_command_recognized()
            .withf(|results| results.len() == 1 && results[0].command_id == 7)
            .times(1)
            .return_const(());
        sink.expect_on_command_timeout().never();
        sink.expect_on_fault().never();

        controller.step(&wake(WakeState::Detected, None), &mut sink);
        controller.step(&silent(), &mut sink);
        assert_eq!(controller.state(), PipelineState::Listening);
    }
}
