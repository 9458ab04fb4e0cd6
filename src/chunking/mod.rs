
use serde::{Deserialize, Serialize};

/// Configuration for narrative chunking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters
    pub max_chunk_length: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_chunk_length: 300,
        }
    }
}

/// Length of a chunk as stored alongside it, counted in characters rather
/// than bytes so non-ASCII narrative text is not over-counted.
#[inline]
pub fn text_length(text: &str) -> usize {
    text.chars().count()
}

/// Deterministic chunk identifier derived from the source memo and the
/// 1-based position of the chunk within it.
#[inline]
pub fn chunk_id(source_id: &str, sequence_index: u32) -> String {
    format!("{}-{}", source_id, sequence_index)
}

/// Split narrative text into bounded chunks at sentence boundaries.
///
/// Sentences are accumulated greedily into a running buffer; when appending
/// the next sentence would push the buffer to `max_length` or beyond, the
/// buffer is flushed as a chunk and the sentence starts a new one. A single
/// sentence longer than `max_length` is emitted whole as its own chunk;
/// sentences are never split internally. Identical input always yields
/// identical boundaries.
#[inline]
pub fn split_text(text: &str, max_length: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if text_length(text) <= max_length {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for sentence in text.split(". ") {
        // Restore the period consumed by the split
        let mut sentence = sentence.to_string();
        if !sentence.ends_with('.') {
            sentence.push('.');
        }
        let sentence_len = text_length(&sentence);

        if current_len + sentence_len < max_length {
            current.push_str(&sentence);
            current.push(' ');
            current_len += sentence_len + 1;
        } else {
            if !current.is_empty() {
                chunks.push(current.trim_end().to_string());
            }
            current = sentence;
            current.push(' ');
            current_len = sentence_len + 1;
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }

    chunks
}
