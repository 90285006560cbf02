//! Incremental Server-Sent Events parsing for LLM streaming responses.
//!
//! Converts a byte stream into `data:` payloads. Handles multi-line data
//! fields, comment lines, CRLF line endings, and the `[DONE]` sentinel.

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Joined `data:` payload.
    pub data: String,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental parser: feed byte chunks, collect completed events.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns events completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();

        for ch in text.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.line_buffer);
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if let Some(event) = self.process_line(line) {
                    events.push(event);
                }
            } else {
                self.line_buffer.push(ch);
            }
        }
        events
    }

    /// Flush a trailing event that never saw its terminating blank line.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.process_line(line);
        }
        if self.data_lines.is_empty() {
            return None;
        }
        Some(self.build())
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        // Blank line = event boundary.
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(self.build());
        }
        // Comment line.
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
        }
        // `event:`/`id:` fields are irrelevant for chat completions.
        None
    }

    fn build(&mut self) -> SseEvent {
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        SseEvent { data }
    }
}
