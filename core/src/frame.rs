use serde_json::Value;
use tracing::{debug, trace};

pub const EVENT_PREFIX: &str = "event:";
pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Event types understood by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Meta,
    Token,
    Citations,
    Evaluation,
    Done,
    Error,
    Other(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "connected" => Self::Connected,
            "meta" => Self::Meta,
            "token" => Self::Token,
            "citations" => Self::Citations,
            "evaluation" => Self::Evaluation,
            "done" => Self::Done,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One parsed frame, handed to the query handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { meta: Value },
    Token { text: String },
    Meta { payload: Value },
    Citations { list: Vec<Value> },
    Evaluation { payload: Value },
    Done { summary: Value },
    Error { cause: String },
}

impl StreamEvent {
    /// Whether no further frames follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// UTF-8 decoder that holds back an incomplete trailing sequence until the
/// next chunk completes it. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush at end of input; a dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

/// Stateful frame parser. Feed it raw chunks in arrival order.
///
/// The endpoint writes `event: <type>` and `data: <payload>` lines with no
/// frame terminator, and the event type applies to every following line
/// until the next `event:` line.
#[derive(Debug, Default)]
pub struct FrameParser {
    decoder: Utf8Decoder,
    buffer: String,
    current: Option<EventKind>,
    finished: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal frame was produced; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse every complete line in `chunk`, keeping a trailing partial line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let text = self.decoder.decode(chunk);
        self.buffer.push_str(&text);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.process_line(&line[..line.len() - 1], &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// End of input: the remaining partial line is parsed as a final line.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.process_line(&rest, &mut events);
        }
        if !self.finished && self.current == Some(EventKind::Done) {
            self.emit_bare_done(&mut events);
        }
        events
    }

    fn process_line(&mut self, raw: &str, events: &mut Vec<StreamEvent>) {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        // A done frame only waits for its own payload line.
        if self.current == Some(EventKind::Done) && !line.starts_with(DATA_PREFIX) {
            self.emit_bare_done(events);
            return;
        }
        if line.trim().is_empty() || line.starts_with(':') {
            return;
        }

        if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
            let kind = EventKind::parse(name.trim());
            trace!(event = ?kind, "event type");
            self.current = Some(kind);
            return;
        }

        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            let data = data.trim();
            if data == DONE_SENTINEL {
                self.emit_bare_done(events);
                return;
            }
            if data.is_empty() {
                return;
            }
            let kind = self.current.clone().unwrap_or(EventKind::Token);
            if let Some(event) = route(&kind, decode_payload(data)) {
                self.emit(event, events);
            }
            return;
        }

        // Token continuation lines may arrive without a data prefix.
        if self.current == Some(EventKind::Token) {
            let text = line.trim();
            self.emit(
                StreamEvent::Token {
                    text: text.to_string(),
                },
                events,
            );
        } else {
            debug!(line, "ignoring unprefixed line outside a token event");
        }
    }

    fn emit(&mut self, event: StreamEvent, events: &mut Vec<StreamEvent>) {
        self.finished = event.is_terminal();
        events.push(event);
    }

    fn emit_bare_done(&mut self, events: &mut Vec<StreamEvent>) {
        self.emit(
            StreamEvent::Done {
                summary: Value::Null,
            },
            events,
        );
    }
}

/// Structured payloads decode as JSON; anything else stays literal text.
fn decode_payload(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}

fn route(kind: &EventKind, payload: Value) -> Option<StreamEvent> {
    let event = match kind {
        EventKind::Connected => StreamEvent::Connected { meta: payload },
        EventKind::Meta => StreamEvent::Meta { payload },
        EventKind::Token => StreamEvent::Token {
            text: text_of(payload, &["token", "text", "content"]),
        },
        EventKind::Citations => StreamEvent::Citations {
            list: citations_of(payload),
        },
        EventKind::Evaluation => StreamEvent::Evaluation { payload },
        EventKind::Done => StreamEvent::Done { summary: payload },
        EventKind::Error => StreamEvent::Error {
            cause: text_of(payload, &["message", "error", "detail"]),
        },
        EventKind::Other(name) => {
            debug!(event = %name, "ignoring frame of unknown event type");
            return None;
        }
    };
    Some(event)
}

fn text_of(payload: Value, fields: &[&str]) -> String {
    match payload {
        Value::String(text) => text,
        Value::Object(ref map) => fields
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

fn citations_of(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(list) => list,
        Value::Null => Vec::new(),
        Value::Object(mut map) => match map.remove("citations") {
            Some(Value::Array(list)) => list,
            Some(other) => vec![other],
            None => vec![Value::Object(map)],
        },
        other => vec![other],
    }
}
