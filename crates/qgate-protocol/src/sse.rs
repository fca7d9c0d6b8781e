//! Incremental server-sent-event parsing plus a tolerant payload decoder.
//!
//! Upstreams do not agree on stream framing: most send SSE, some send
//! newline-delimited JSON, and Google's non-`alt=sse` endpoints send one big
//! JSON array. `PayloadDecoder` sniffs the framing from the first bytes and
//! yields bare data payloads either way.

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEvent {
    pub name: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed arbitrary chunk boundaries; complete events
/// are returned as they close (blank line).
#[derive(Debug, Default)]
pub struct EventStreamParser {
    carry: String,
    pending_name: Option<String>,
    pending_data: Vec<String>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<ServerEvent> {
        self.carry.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let Some(newline) = self.carry.find('\n') else {
                break;
            };
            let line: String = self.carry.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.take_line(line, &mut out);
        }

        out
    }

    pub fn feed_bytes(&mut self, chunk: &Bytes) -> Vec<ServerEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.feed(text),
            Err(_) => Vec::new(),
        }
    }

    /// Drain the trailing partial line and close any open event.
    pub fn flush(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            self.take_line(line.trim_end_matches('\r'), &mut out);
        }
        self.close_event(&mut out);
        out
    }

    fn take_line(&mut self, line: &str, out: &mut Vec<ServerEvent>) {
        if line.is_empty() {
            self.close_event(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.pending_data.push(value.to_string()),
            // id / retry are irrelevant to relaying.
            _ => {}
        }
    }

    fn close_event(&mut self, out: &mut Vec<ServerEvent>) {
        if self.pending_name.is_none() && self.pending_data.is_empty() {
            return;
        }
        out.push(ServerEvent {
            name: self.pending_name.take(),
            data: std::mem::take(&mut self.pending_data).join("\n"),
        });
    }
}

/// Render one SSE frame, with an optional `event:` line.
pub fn encode_frame(name: Option<&str>, data: &str) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + 32);
    if let Some(name) = name {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(data.as_bytes());
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

#[derive(Debug)]
enum Framing {
    Undetected,
    Sse(EventStreamParser),
    Ndjson,
    JsonArray(ArrayScanner),
}

/// Framing-sniffing decoder: yields bare JSON payload strings regardless of
/// whether the upstream speaks SSE, NDJSON, or a streamed JSON array.
#[derive(Debug)]
pub struct PayloadDecoder {
    framing: Framing,
    carry: String,
}

impl Default for PayloadDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadDecoder {
    pub fn new() -> Self {
        Self {
            framing: Framing::Undetected,
            carry: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        match &mut self.framing {
            Framing::Undetected => {
                self.carry.push_str(text);
                self.detect()
            }
            Framing::Sse(parser) => drain_sse(parser.feed(text)),
            Framing::Ndjson => {
                self.carry.push_str(text);
                drain_lines(&mut self.carry)
            }
            Framing::JsonArray(scanner) => scanner.scan(text),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.framing {
            Framing::Undetected => {
                let rest = self.carry.trim();
                if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![rest.to_string()]
                }
            }
            Framing::Sse(parser) => drain_sse(parser.flush()),
            Framing::Ndjson => {
                let mut out = drain_lines(&mut self.carry);
                let rest = self.carry.trim();
                if !rest.is_empty() {
                    out.push(rest.to_string());
                }
                self.carry.clear();
                out
            }
            Framing::JsonArray(scanner) => scanner.finish(),
        }
    }

    fn detect(&mut self) -> Vec<String> {
        let first = self.carry.chars().find(|c| !c.is_whitespace());
        let looks_like_sse = self.carry.contains("data:")
            || self.carry.contains("event:")
            || matches!(first, Some(':'));
        if looks_like_sse {
            let mut parser = EventStreamParser::new();
            let events = parser.feed(&self.carry);
            self.carry.clear();
            self.framing = Framing::Sse(parser);
            return drain_sse(events);
        }
        match first {
            Some('[') => {
                let mut scanner = ArrayScanner::default();
                let out = scanner.scan(&std::mem::take(&mut self.carry));
                self.framing = Framing::JsonArray(scanner);
                out
            }
            Some('{') => {
                self.framing = Framing::Ndjson;
                drain_lines(&mut self.carry)
            }
            // Either nothing yet, or a prefix of "data"/"event" without the
            // colon; wait for more bytes.
            _ => Vec::new(),
        }
    }
}

fn drain_sse(events: Vec<ServerEvent>) -> Vec<String> {
    events
        .into_iter()
        .filter(|event| !event.data.is_empty())
        .map(|event| event.data)
        .collect()
}

fn drain_lines(carry: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(newline) = carry.find('\n') {
        let line: String = carry.drain(..=newline).collect();
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    out
}

/// Walks a top-level JSON array, emitting each complete object. Tracks string
/// and escape state so braces inside strings do not confuse the depth count.
#[derive(Debug, Default)]
struct ArrayScanner {
    started: bool,
    object: String,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl ArrayScanner {
    fn scan(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if !self.started {
                if ch == '[' {
                    self.started = true;
                }
                continue;
            }
            if self.depth == 0 {
                if ch == '{' {
                    self.depth = 1;
                    self.object.push(ch);
                }
                continue;
            }
            self.object.push(ch);
            if self.in_string {
                match (self.escaped, ch) {
                    (true, _) => self.escaped = false,
                    (false, '\\') => self.escaped = true,
                    (false, '"') => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(std::mem::take(&mut self.object));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        if self.depth == 0 && !self.object.trim().is_empty() {
            vec![std::mem::take(&mut self.object)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_split_events() {
        let mut parser = EventStreamParser::new();
        let mut events = parser.feed("event: message_start\nda");
        assert!(events.is_empty());
        events.extend(parser.feed("ta: {\"a\":1}\n\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn parser_joins_multi_line_data() {
        let mut parser = EventStreamParser::new();
        let events = parser.feed("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn parser_skips_comments_and_retry() {
        let mut parser = EventStreamParser::new();
        let events = parser.feed(": keep-alive\nretry: 100\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn flush_closes_dangling_event() {
        let mut parser = EventStreamParser::new();
        assert!(parser.feed("data: tail").is_empty());
        let events = parser.flush();
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn decoder_sniffs_sse() {
        let mut decoder = PayloadDecoder::new();
        let payloads = decoder.feed(b"data: {\"x\":1}\n\ndata: {\"x\":2}\n\n");
        assert_eq!(payloads, vec!["{\"x\":1}", "{\"x\":2}"]);
    }

    #[test]
    fn decoder_sniffs_ndjson() {
        let mut decoder = PayloadDecoder::new();
        let payloads = decoder.feed(b"{\"x\":1}\n{\"x\":2}\n");
        assert_eq!(payloads, vec!["{\"x\":1}", "{\"x\":2}"]);
    }

    #[test]
    fn decoder_sniffs_json_array_with_strings_containing_braces() {
        let mut decoder = PayloadDecoder::new();
        let mut payloads = decoder.feed(b"[{\"t\":\"a}b\"},");
        payloads.extend(decoder.feed(b"{\"t\":\"c\"}]"));
        assert_eq!(payloads, vec!["{\"t\":\"a}b\"}", "{\"t\":\"c\"}"]);
    }

    #[test]
    fn encode_frame_includes_event_name() {
        let frame = encode_frame(Some("ping"), "{}");
        assert_eq!(&frame[..], b"event: ping\ndata: {}\n\n");
        let frame = encode_frame(None, "[DONE]");
        assert_eq!(&frame[..], b"data: [DONE]\n\n");
    }
}
