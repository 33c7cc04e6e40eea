/// Phrase table and transcript-driven command recognition
///
/// Scores a free-form transcript against a fixed list of command phrases.
/// A phrase matches when `0.7 * sequence_similarity + 0.3 * token_overlap`
/// reaches the table threshold.

use crate::adapter::RecognizerFactory;
use crate::engine::{rank_matches, CommandEngine, CommandMatch, CommandOutcome};
use crate::frame::Sample;
use crate::models::MULTINET_PREFIX;
use std::collections::HashSet;
use tracing::{debug, info};

/// Default match threshold
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.70;

const SEQUENCE_WEIGHT: f32 = 0.7;
const OVERLAP_WEIGHT: f32 = 0.3;

/// Lowercase, drop punctuation, collapse whitespace
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation())
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character-level similarity in [0, 1]: 2 * LCS / total length
pub fn sequence_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    // Single-row LCS table
    let mut row = vec![0usize; b.len() + 1];
    for &ca in &a {
        let mut diag = 0;
        for (j, &cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diag + 1
            } else {
                above.max(row[j])
            };
            diag = above;
        }
    }

    2.0 * row[b.len()] as f32 / total as f32
}

/// Fraction of the phrase's distinct words present in the transcript
pub fn token_overlap(phrase: &str, transcript: &str) -> f32 {
    let phrase_tokens: HashSet<&str> = phrase.split_whitespace().collect();
    let heard: HashSet<&str> = transcript.split_whitespace().collect();
    let shared = phrase_tokens.intersection(&heard).count();
    shared as f32 / phrase_tokens.len().max(1) as f32
}

/// Combined phrase score of two normalized strings
pub fn phrase_score(phrase: &str, transcript: &str) -> f32 {
    SEQUENCE_WEIGHT * sequence_similarity(phrase, transcript)
        + OVERLAP_WEIGHT * token_overlap(phrase, transcript)
}

#[derive(Debug, Clone)]
struct Phrase {
    command_id: u32,
    text: String,
}

/// Command phrases with their ids
#[derive(Debug, Clone)]
pub struct PhraseTable {
    phrases: Vec<Phrase>,
    threshold: f32,
}

impl Default for PhraseTable {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl PhraseTable {
    pub fn new(threshold: f32) -> Self {
        Self {
            phrases: Vec::new(),
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Table with command ids assigned in order, starting at 1
    pub fn from_phrases<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::default();
        for (i, phrase) in phrases.into_iter().enumerate() {
            table.add(i as u32 + 1, phrase.as_ref());
        }
        table
    }

    /// Several phrases may share one command id
    pub fn add(&mut self, command_id: u32, phrase: &str) -> &mut Self {
        self.phrases.push(Phrase {
            command_id,
            text: normalize(phrase),
        });
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Normalized text of the phrase at `phrase_id`
    pub fn phrase(&self, phrase_id: u32) -> Option<&str> {
        self.phrases.get(phrase_id as usize).map(|p| p.text.as_str())
    }

    /// Every phrase scoring at or above the threshold, best first
    pub fn rank(&self, transcript: &str) -> Vec<CommandMatch> {
        let heard = normalize(transcript);
        if heard.is_empty() {
            return Vec::new();
        }

        let mut matches: Vec<CommandMatch> = self
            .phrases
            .iter()
            .enumerate()
            .filter_map(|(phrase_id, phrase)| {
                let score = phrase_score(&phrase.text, &heard);
                (score >= self.threshold).then(|| CommandMatch {
                    command_id: phrase.command_id,
                    phrase_id: phrase_id as u32,
                    confidence: score,
                    transcript: heard.clone(),
                })
            })
            .collect();

        rank_matches(&mut matches);
        matches
    }
}

/// Streaming speech-to-text backend
pub trait Transcriber: Send {
    /// Consume one chunk; returns a transcript when an utterance completes
    fn accept(&mut self, samples: &[Sample]) -> Option<String>;

    /// Text heard so far in the current utterance
    fn partial(&self) -> String;

    fn reset(&mut self);
}

/// Command engine matching transcriber output against a phrase table
pub struct PhraseCommandEngine<T: Transcriber> {
    transcriber: T,
    table: PhraseTable,
    hits: Vec<u64>,
}

impl<T: Transcriber> PhraseCommandEngine<T> {
    pub fn new(transcriber: T, table: PhraseTable) -> Self {
        let hits = vec![0; table.len()];
        Self {
            transcriber,
            table,
            hits,
        }
    }

    pub fn table(&self) -> &PhraseTable {
        &self.table
    }

    /// Times the phrase at `phrase_id` was the best match
    pub fn hits(&self, phrase_id: u32) -> u64 {
        self.hits.get(phrase_id as usize).copied().unwrap_or(0)
    }

    fn record_hit(&mut self, best: &CommandMatch) {
        let Some(count) = self.hits.get_mut(best.phrase_id as usize) else {
            return;
        };
        *count += 1;

        let phrase = self.table.phrase(best.phrase_id).unwrap_or_default();
        match *count {
            1 => info!("First detection: '{}' (score {:.2})", phrase, best.confidence),
            2 => info!("Second detection: '{}' (score {:.2})", phrase, best.confidence),
            n => info!("Detected '{}' ({} times, score {:.2})", phrase, n, best.confidence),
        }
    }
}

impl<T: Transcriber> CommandEngine for PhraseCommandEngine<T> {
    fn detect(&mut self, samples: &[Sample]) -> CommandOutcome {
        let Some(transcript) = self.transcriber.accept(samples) else {
            return CommandOutcome::Detecting;
        };

        let matches = self.table.rank(&transcript);
        let Some(best) = matches.first().cloned() else {
            debug!("No phrase matched '{}'", transcript);
            return CommandOutcome::Detecting;
        };

        self.record_hit(&best);
        CommandOutcome::Detected(matches)
    }

    fn reset(&mut self) {
        self.transcriber.reset();
    }

    fn partial_transcript(&self) -> String {
        self.transcriber.partial()
    }
}

/// Builds phrase-matching recognizers, each with a fresh transcriber
pub struct PhraseRecognizerFactory<F> {
    table: PhraseTable,
    new_transcriber: F,
}

impl<F> PhraseRecognizerFactory<F> {
    pub fn new(table: PhraseTable, new_transcriber: F) -> Self {
        info!(
            "Phrase recognizer: {} phrase(s), threshold {:.2}",
            table.len(),
            table.threshold()
        );
        Self {
            table,
            new_transcriber,
        }
    }
}

impl<F, T> RecognizerFactory for PhraseRecognizerFactory<F>
where
    F: Fn() -> T + Send + Sync,
    T: Transcriber,
{
    type Recognizer = PhraseCommandEngine<T>;

    fn create(&self, name: &str) -> Option<PhraseCommandEngine<T>> {
        name.starts_with(MULTINET_PREFIX)
            .then(|| PhraseCommandEngine::new((self.new_transcriber)(), self.table.clone()))
    }
}
