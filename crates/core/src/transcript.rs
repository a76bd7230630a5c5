//! Merges streamed transcript fragments into per-speaker entries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

/// One contiguous utterance by a single speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEntry {
    pub id: Uuid,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

/// Ordered transcript of one session.
///
/// A fragment extends the last entry when that entry has the same speaker and
/// is still open; otherwise it starts a new entry. Entries are never removed
/// until [`TranscriptionAggregator::clear`].
#[derive(Debug, Default)]
pub struct TranscriptionAggregator {
    entries: Vec<TranscriptionEntry>,
}

impl TranscriptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one fragment. Returns `false` when the fragment was empty and
    /// nothing changed.
    pub fn push_fragment(&mut self, speaker: Speaker, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        match self.entries.last_mut() {
            Some(last) if last.speaker == speaker && !last.is_final => {
                last.text.push_str(text);
            }
            _ => self.entries.push(TranscriptionEntry {
                id: Uuid::new_v4(),
                speaker,
                text: text.to_string(),
                is_final: false,
            }),
        }
        true
    }

    /// Closes every open entry. Never creates entries.
    pub fn finalize_turn(&mut self) -> bool {
        let mut changed = false;
        for entry in self.entries.iter_mut().filter(|e| !e.is_final) {
            entry.is_final = true;
            changed = true;
        }
        changed
    }

    /// A point-in-time copy for observers.
    pub fn snapshot(&self) -> Vec<TranscriptionEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
