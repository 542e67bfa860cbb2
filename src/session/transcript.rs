//! Partial transcripts and sentence extraction.
//!
//! The recognition upstream only ever sends the *cumulative* text of the
//! current utterance. When a new utterance starts, the cumulative text resets
//! (gets shorter, or is rewritten at the same length). Those resets are the
//! only sentence boundaries we get.

use chrono::{DateTime, Utc};

/// One partial transcript as observed from upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub text: String,
    pub observed_at: DateTime<Utc>,
}

/// Append-only log of partial transcripts for one recognition session.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    snapshots: Vec<Snapshot>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot; returns whether the text differs from the previous one.
    pub fn record(&mut self, text: &str) -> bool {
        let changed = self.snapshots.last().map_or(true, |last| last.text != text);
        self.snapshots.push(Snapshot {
            text: text.to_string(),
            observed_at: Utc::now(),
        });
        changed
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// When the most recent partial arrived.
    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.snapshots.last().map(|s| s.observed_at)
    }

    /// Finalized sentences for everything recorded so far.
    pub fn sentences(&self) -> Vec<String> {
        extract_sentences(self.snapshots.iter().map(|s| s.text.as_str()))
    }
}

/// Split a stream of cumulative partials into finalized sentences.
///
/// A partial that is shorter than its predecessor, or as long but different,
/// starts a new utterance; the predecessor is then final. Lengths are counted
/// in characters, not bytes.
pub fn extract_sentences<'a, I>(partials: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sentences = Vec::new();
    let mut previous: &str = "";

    for current in partials {
        if !previous.is_empty() {
            let (prev_len, cur_len) = (previous.chars().count(), current.chars().count());
            if cur_len < prev_len || (cur_len == prev_len && current != previous) {
                push_trimmed(&mut sentences, previous);
            }
        }
        previous = current;
    }

    if !previous.is_empty() {
        push_trimmed(&mut sentences, previous);
    }
    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        sentences.push(text.to_string());
    }
}
