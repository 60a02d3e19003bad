//! Deterministic text chunking.
//!
//! Chunk boundaries are a pure function of the input text and the chunker
//! configuration, so re-chunking unchanged content always yields the same
//! `(chunk_index, chunk_text)` pairs and re-embedding stays idempotent.
//!
//! The splitter walks the text in windows of at most `max_chars`, preferring
//! to break at a whitespace boundary inside the final quarter of the window,
//! and overlaps consecutive chunks by `overlap_chars` so context spanning a
//! boundary is retrievable from either side.

/// Chunking parameters.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters.
    pub max_chars: usize,
    /// Characters of overlap between consecutive chunks.
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 1200,
            overlap_chars: 200,
        }
    }
}

/// Deterministic character-window chunker.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        // A degenerate overlap would prevent forward progress.
        let overlap = config.overlap_chars.min(config.max_chars.saturating_sub(1));
        Self {
            config: ChunkerConfig {
                max_chars: config.max_chars.max(1),
                overlap_chars: overlap,
            },
        }
    }

    /// Split `text` into chunks. Empty or whitespace-only input yields none.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.iter().all(|c| c.is_whitespace()) {
            return Vec::new();
        }

        let max = self.config.max_chars;
        let overlap = self.config.overlap_chars;
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let hard_end = (start + max).min(chars.len());
            let end = if hard_end < chars.len() {
                self.break_point(&chars, start, hard_end)
            } else {
                hard_end
            };

            let chunk: String = chars[start..end].iter().collect();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }

            if end >= chars.len() {
                break;
            }
            start = end.saturating_sub(overlap).max(start + 1);
        }

        chunks
    }

    /// Prefer a whitespace boundary in the last quarter of the window.
    fn break_point(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let window = hard_end - start;
        let search_from = hard_end - (window / 4).max(1);
        for i in (search_from..hard_end).rev() {
            if chars[i].is_whitespace() {
                return i;
            }
        }
        hard_end
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_chars: max,
            overlap_chars: overlap,
        })
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunker(100, 20).chunk("hello world");
        assert_eq!(chunks, vec!["hello world"]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunker(100, 20).chunk("").is_empty());
        assert!(chunker(100, 20).chunk("   \n\t ").is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "The retry node re-invokes the upstream action with exponential backoff. "
            .repeat(40);
        let c = chunker(200, 40);
        assert_eq!(c.chunk(&text), c.chunk(&text));
    }

    #[test]
    fn chunks_respect_max_length() {
        let text = "word ".repeat(500);
        let chunks = chunker(120, 20).chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 120);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "alpha beta gamma delta ".repeat(50);
        let chunks = chunker(100, 30).chunk(&text);
        assert!(chunks.len() > 1);

        // The tail of each chunk reappears at the head of the next.
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(10).collect::<String>()
                .chars().rev().collect();
            assert!(pair[1].contains(tail.trim()), "no overlap between chunks");
        }
    }

    #[test]
    fn breaks_at_whitespace_when_possible() {
        let text = "aaaa bbbb cccc dddd eeee ffff gggg hhhh";
        let chunks = chunker(12, 0).chunk(text);
        // No chunk should split a word in half.
        for chunk in &chunks {
            for word in chunk.split_whitespace() {
                assert_eq!(word.len(), 4, "split mid-word: {chunk:?}");
            }
        }
    }

    #[test]
    fn unbreakable_run_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = chunker(100, 10).chunk(&text);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }
}
