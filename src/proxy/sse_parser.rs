//! Low-level SSE line protocol parser.
//!
//! Parses raw SSE byte streams into structured events per the SSE
//! specification, incrementally as chunks arrive.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn is_empty(&self) -> bool {
        self.event.is_empty() && self.data.is_empty()
    }

    /// Serialize back to SSE wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut lines: Vec<String> = Vec::new();
        if !self.event.is_empty() {
            lines.push(format!("event: {}", self.event));
        }
        if !self.data.is_empty() {
            for line in self.data.split('\n') {
                lines.push(format!("data: {line}"));
            }
        }
        if !self.id.is_empty() {
            lines.push(format!("id: {}", self.id));
        }
        if let Some(retry) = self.retry {
            lines.push(format!("retry: {retry}"));
        }
        lines.push(String::new());
        let mut out = lines.join("\n").into_bytes();
        out.push(b'\n');
        out
    }
}

/// Incremental SSE parser that processes byte chunks into events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: SseEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text, returning any complete events dispatched by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if !self.current.is_empty() {
                    events.push(std::mem::take(&mut self.current));
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field_name, value) = match line.split_once(':') {
                Some((name, mut value)) => {
                    if let Some(stripped) = value.strip_prefix(' ') {
                        value = stripped;
                    }
                    (name, value)
                }
                None => (line, ""),
            };

            match field_name {
                "event" => self.current.event = value.to_string(),
                "data" => {
                    if !self.current.data.is_empty() {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                }
                "id" => self.current.id = value.to_string(),
                "retry" => {
                    if let Ok(n) = value.parse::<u64>() {
                        self.current.retry = Some(n);
                    }
                }
                _ => {}
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message_start");
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn round_trips_through_to_bytes() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        let bytes = events[0].to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        let mut reparser = SseParser::new();
        let reparsed = reparser.feed(&text);
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed[0].event, "message_start");
        assert_eq!(reparsed[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn multiple_data_lines_concatenate_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn comment_lines_are_discarded() {
        let mut parser = SseParser::new();
        let events = parser.feed(": this is a comment\ndata: hi\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn partial_lines_are_retained_until_newline() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: par").is_empty());
        let events = parser.feed("tial\n\n");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn leading_space_after_colon_is_stripped_exactly_once() {
        let mut parser = SseParser::new();
        let events = parser.feed("data:  two leading spaces\n\n");
        assert_eq!(events[0].data, " two leading spaces");
    }

    #[test]
    fn retry_field_parse_failure_is_silently_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed("retry: not-a-number\ndata: x\n\n");
        assert_eq!(events[0].retry, None);
    }
}
