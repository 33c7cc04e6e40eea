/// Pipeline events and sinks
///
/// The pipeline reports only discrete events; everything recoverable is
/// resolved inside the controller.

use crate::engine::CommandMatch;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event crossing the pipeline boundary
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    WakeDetected {
        model_index: usize,
        word_index: usize,
        /// Verified trigger channel (multi-mic only)
        channel: Option<usize>,
    },

    /// Matches ranked by confidence, highest first
    CommandRecognized(Vec<CommandMatch>),

    CommandTimeout { partial_transcript: String },

    /// No audio above the calibrated silence threshold for this long
    SilenceTimeout { silent_for: Duration },

    /// The pipeline halted; only a full restart recovers
    Fault { reason: String },
}

impl PipelineEvent {
    /// Replay this event into `sink`
    pub fn deliver<S: EventSink + ?Sized>(&self, sink: &mut S) {
        match self {
            PipelineEvent::WakeDetected {
                model_index,
                word_index,
                channel,
            } => sink.on_wake_detected(*model_index, *word_index, *channel),
            PipelineEvent::CommandRecognized(results) => sink.on_command_recognized(results),
            PipelineEvent::CommandTimeout { partial_transcript } => {
                sink.on_command_timeout(partial_transcript)
            }
            PipelineEvent::SilenceTimeout { silent_for } => sink.on_silence_timeout(*silent_for),
            PipelineEvent::Fault { reason } => sink.on_fault(reason),
        }
    }
}

/// Application-side consumer of pipeline events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send {
    fn on_wake_detected(&mut self, model_index: usize, word_index: usize, channel: Option<usize>);

    fn on_command_recognized(&mut self, results: &[CommandMatch]);

    fn on_command_timeout(&mut self, partial_transcript: &str);

    fn on_silence_timeout(&mut self, silent_for: Duration);

    fn on_fault(&mut self, reason: &str);
}

/// Collects events in memory
impl EventSink for Vec<PipelineEvent> {
    fn on_wake_detected(&mut self, model_index: usize, word_index: usize, channel: Option<usize>) {
        self.push(PipelineEvent::WakeDetected {
            model_index,
            word_index,
            channel,
        });
    }

    fn on_command_recognized(&mut self, results: &[CommandMatch]) {
        self.push(PipelineEvent::CommandRecognized(results.to_vec()));
    }

    fn on_command_timeout(&mut self, partial_transcript: &str) {
        self.push(PipelineEvent::CommandTimeout {
            partial_transcript: partial_transcript.to_string(),
        });
    }

    fn on_silence_timeout(&mut self, silent_for: Duration) {
        self.push(PipelineEvent::SilenceTimeout { silent_for });
    }

    fn on_fault(&mut self, reason: &str) {
        self.push(PipelineEvent::Fault {
            reason: reason.to_string(),
        });
    }
}

/// Forwards events to an async consumer
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PipelineEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("Failed to send pipeline event: {}", e);
        }
    }
}

impl EventSink for ChannelSink {
    fn on_wake_detected(&mut self, model_index: usize, word_index: usize, channel: Option<usize>) {
        self.send(PipelineEvent::WakeDetected {
            model_index,
            word_index,
            channel,
        });
    }

    fn on_command_recognized(&mut self, results: &[CommandMatch]) {
        self.send(PipelineEvent::CommandRecognized(results.to_vec()));
    }

    fn on_command_timeout(&mut self, partial_transcript: &str) {
        self.send(PipelineEvent::CommandTimeout {
            partial_transcript: partial_transcript.to_string(),
        });
    }

    fn on_silence_timeout(&mut self, silent_for: Duration) {
        self.send(PipelineEvent::SilenceTimeout { silent_for });
    }

    fn on_fault(&mut self, reason: &str) {
        self.send(PipelineEvent::Fault {
            reason: reason.to_string(),
        });
    }
}

/// Logs every event and nothing else
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_wake_detected(&mut self, model_index: usize, word_index: usize, channel: Option<usize>) {
        info!(
            "Wake word detected: model={}, word={}, channel={:?}",
            model_index, word_index, channel
        );
    }

    fn on_command_recognized(&mut self, results: &[CommandMatch]) {
        if let Some(best) = results.first() {
            info!(
                "Command recognized: id={}, phrase={}, confidence={:.2}, transcript='{}' ({} candidate(s))",
                best.command_id,
                best.phrase_id,
                best.confidence,
                best.transcript,
                results.len()
            );
        }
    }

    fn on_command_timeout(&mut self, partial_transcript: &str) {
        warn!("Command timed out, partial transcript: '{}'", partial_transcript);
    }

    fn on_silence_timeout(&mut self, silent_for: Duration) {
        warn!("Silent for {:.1}s", silent_for.as_secs_f32());
    }

    fn on_fault(&mut self, reason: &str) {
        error!("Pipeline fault: {}", reason);
    }
}
