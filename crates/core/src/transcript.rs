//! The ordered conversation transcript of one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One utterance segment.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    /// When the entry was created. Streaming updates keep this unchanged.
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
}

/// Append-only transcript with in-place update of a trailing assistant entry.
///
/// Entries are never reordered or removed while a session lives; the whole
/// sequence is cleared when a session starts or ends.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
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

    /// Records a user utterance. Partial user speech is not surfaced, so
    /// returns `false` and leaves the transcript untouched unless `is_final`.
    pub fn push_user(&mut self, content: String, is_final: bool) -> bool {
        if !is_final {
            return false;
        }
        self.entries.push(TranscriptEntry {
            role: Role::User,
            content,
            timestamp: Utc::now(),
            is_final: true,
        });
        true
    }

    /// Merges streamed assistant text: replaces the trailing entry when it
    /// belongs to the assistant, otherwise starts a new assistant turn.
    pub fn merge_assistant(&mut self, content: String, is_final: bool) {
        match self.entries.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = content;
                last.is_final = is_final;
            }
            _ => self.entries.push(TranscriptEntry {
                role: Role::Assistant,
                content,
                timestamp: Utc::now(),
                is_final,
            }),
        }
    }
}
