//! Push-based server-sent-events framing.
//!
//! Provider adapters feed transport chunks into [`SseParser::push`] and
//! receive complete events back, regardless of where the transport (or the
//! unary-replay fallback) happened to split the byte stream.  CRLF is
//! normalised to LF before framing; comment lines are dropped; the
//! `[DONE]` sentinel is passed through as ordinary data for the caller to
//! recognise.

/// One framed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when the server sent one.
    pub event: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
}

impl SseEvent {
    /// True for the `[DONE]` end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of text, returning every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = self.take_line(line.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.take_line(&line);
        }
        self.flush_event()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush_event();
        }
        if line.starts_with(':') {
            return None; // keep-alive comment
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event_type = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Unknown fields (`id:`, `retry:`) are ignored.
        None
    }

    fn flush_event(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() && self.event_type.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event_type.take(),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        (!event.data.is_empty() || event.event.is_some()).then_some(event)
    }
}
