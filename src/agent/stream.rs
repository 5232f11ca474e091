//! Agent stdout parsing.
//!
//! Output arrives in arbitrary chunks; `LineBuffer` restores line framing and
//! `parse_stream_line` maps stream-json lines onto headless events.

use serde_json::Value;

use crate::events::{HeadlessEvent, OutputStream};

/// Re-frames chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without terminators.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .lines()
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect()
    }

    /// Take a trailing line that never saw its newline.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Events for one line of agent stdout.
pub fn parse_stream_line(line: &str) -> Vec<HeadlessEvent> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    let json = match serde_json::from_str::<Value>(line) {
        Ok(json) if json.is_object() => json,
        _ => return vec![HeadlessEvent::output(OutputStream::Stdout, format!("{}\n", line))],
    };
    let Some(kind) = json.get("type").and_then(Value::as_str) else {
        return vec![HeadlessEvent::output(OutputStream::Stdout, format!("{}\n", line))];
    };

    let mut events = Vec::new();
    match kind {
        "system" => {
            if let Some(model) = json.get("model").and_then(Value::as_str) {
                events.push(HeadlessEvent::Model {
                    model: model.to_string(),
                });
            }
        }
        "assistant" => {
            if let Some(message) = json.get("message") {
                parse_content(message.get("content"), &mut events);
                events.extend(tokens(message.get("usage")));
            }
        }
        "result" => events.extend(tokens(json.get("usage"))),
        // Tool results echoed back, stream deltas and anything else stay quiet
        _ => {}
    }
    events
}

fn parse_content(content: Option<&Value>, events: &mut Vec<HeadlessEvent>) {
    match content {
        Some(Value::String(text)) => events.push(HeadlessEvent::output(OutputStream::Stdout, text.clone())),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            events.push(HeadlessEvent::output(OutputStream::Stdout, text));
                        }
                    }
                    Some("tool_use") => events.push(HeadlessEvent::Tool {
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        input: block.get("input").cloned(),
                    }),
                    Some("thinking") => {
                        if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                            events.push(HeadlessEvent::Reasoning { text: text.to_string() });
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn tokens(usage: Option<&Value>) -> Option<HeadlessEvent> {
    let usage = usage?;
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    if input == 0 && output == 0 {
        return None;
    }
    Some(HeadlessEvent::Tokens { input, output })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_reframes_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push("hel").is_empty());
        assert_eq!(buffer.push("lo\r\nwor"), vec!["hello"]);
        assert_eq!(buffer.push("ld\n\nx"), vec!["world", ""]);
        assert_eq!(buffer.flush(), Some("x".to_string()));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn test_plain_text_is_output() {
        let events = parse_stream_line("compiling...");
        assert_eq!(events, vec![HeadlessEvent::output(OutputStream::Stdout, "compiling...\n")]);
        assert!(parse_stream_line("   ").is_empty());
    }

    #[test]
    fn test_system_init_model() {
        let events = parse_stream_line(r#"{"type":"system","subtype":"init","model":"claude-sonnet"}"#);
        assert_eq!(
            events,
            vec![HeadlessEvent::Model {
                model: "claude-sonnet".to_string()
            }]
        );
    }

    #[test]
    fn test_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"plan first"},
            {"type":"text","text":"Editing file"},
            {"type":"tool_use","name":"Edit","input":{"path":"a.rs"}}
        ],"usage":{"input_tokens":10,"output_tokens":4}}}"#
            .replace('\n', "");
        let kinds: Vec<&str> = parse_stream_line(&line).iter().map(HeadlessEvent::kind).collect();
        assert_eq!(kinds, vec!["reasoning", "output", "tool", "tokens"]);
    }

    #[test]
    fn test_result_usage() {
        let events = parse_stream_line(r#"{"type":"result","usage":{"input_tokens":100,"output_tokens":20}}"#);
        assert_eq!(events, vec![HeadlessEvent::Tokens { input: 100, output: 20 }]);
    }

    #[test]
    fn test_uninteresting_json_is_quiet() {
        assert!(parse_stream_line(r#"{"type":"user","message":{}}"#).is_empty());
    }
}
