//! Sentence segmentation for streaming TTS.
//!
//! The orchestrator feeds LLM text deltas in and receives completed
//! sentences out; `flush` returns whatever is buffered when the stream ends.
//! Every fed codepoint comes back exactly once, partitioned into sentences.

/// Characters that end a sentence.
const BOUNDARIES: &[char] = &['\n', '.', '!', '?', ';', '。', '！', '？', '；', '…'];

/// Streaming sentence cutter.
pub struct Segmenter {
    buffer: String,
    /// Force a cut after this many characters; `0` disables the length cut.
    max_runes: usize,
}

impl Segmenter {
    pub fn new(max_runes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_runes,
        }
    }

    /// Feed a delta; returns zero or more completed sentences in order.
    pub fn feed(&mut self, delta: &str) -> Vec<String> {
        if delta.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(delta);

        let mut sentences = Vec::new();
        loop {
            let mut cut_at = None;
            let mut runes = 0usize;
            for (i, c) in self.buffer.char_indices() {
                runes += 1;
                if BOUNDARIES.contains(&c) {
                    cut_at = Some(i + c.len_utf8());
                    break;
                }
                if self.max_runes > 0 && runes >= self.max_runes {
                    cut_at = Some(i + c.len_utf8());
                    break;
                }
            }
            match cut_at {
                Some(end) => {
                    let rest = self.buffer.split_off(end);
                    sentences.push(std::mem::replace(&mut self.buffer, rest));
                }
                None => break,
            }
        }
        sentences
    }

    /// Return the buffered remainder as a final sentence, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    /// Drop any buffered text (barge-in).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
