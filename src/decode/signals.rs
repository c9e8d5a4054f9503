//! Completion-signal emitter: `[DOPPLER:RESULT]`, `[DOPPLER:ERROR]`,
//! `[DOPPLER:DONE]` written to a host I/O channel. Generalizes an
//! SSE-to-`[DONE]`-sentinel pattern from an axum `Event` stream to a plain
//! `Write` sink, since the host front-end is out of this crate's scope.

use std::io::Write;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
struct ResultSignal<'a> {
    request_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorSignal<'a> {
    request_id: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct DoneSignal<'a> {
    request_id: &'a str,
    reason: &'a str,
}

/// Emits the three completion-signal lines to any `Write`-like sink. Exactly
/// one `DONE` is emitted per request, always last, regardless of whether a
/// `RESULT` or `ERROR` preceded it.
pub struct SignalEmitter<W: Write> {
    sink: W,
    request_id: String,
    done_emitted: bool,
}

impl<W: Write> SignalEmitter<W> {
    pub fn new(sink: W, request_id: impl Into<String>) -> Self {
        Self {
            sink,
            request_id: request_id.into(),
            done_emitted: false,
        }
    }

    fn write_line(&mut self, tag: &str, payload: &Value) -> std::io::Result<()> {
        writeln!(self.sink, "[{tag}] {payload}")
    }

    pub fn result(&mut self, text: &str) -> std::io::Result<()> {
        let payload = serde_json::to_value(ResultSignal {
            request_id: &self.request_id,
            text,
        })
        .expect("ResultSignal always serializes");
        self.write_line("DOPPLER:RESULT", &payload)
    }

    pub fn error(&mut self, message: &str) -> std::io::Result<()> {
        let payload = serde_json::to_value(ErrorSignal {
            request_id: &self.request_id,
            message,
        })
        .expect("ErrorSignal always serializes");
        self.write_line("DOPPLER:ERROR", &payload)
    }

    pub fn done(&mut self, reason: &str) -> std::io::Result<()> {
        if self.done_emitted {
            return Ok(());
        }
        let payload = serde_json::to_value(DoneSignal {
            request_id: &self.request_id,
            reason,
        })
        .expect("DoneSignal always serializes");
        self.done_emitted = true;
        self.write_line("DOPPLER:DONE", &payload)
    }
}

impl<W: Write> Drop for SignalEmitter<W> {
    fn drop(&mut self) {
        if !self.done_emitted {
            let _ = self.done("dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_result_then_done_exactly_once() {
        let mut buf = Vec::new();
        {
            let mut emitter = SignalEmitter::new(&mut buf, "req-1");
            emitter.result("hello").unwrap();
            emitter.done("completed").unwrap();
            emitter.done("completed").unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches("[DOPPLER:DONE]").count(), 1);
        assert!(text.contains("[DOPPLER:RESULT]"));
    }

    #[test]
    fn drop_without_explicit_done_still_emits_one() {
        let mut buf = Vec::new();
        {
            let mut emitter = SignalEmitter::new(&mut buf, "req-2");
            emitter.error("boom").unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches("[DOPPLER:DONE]").count(), 1);
        assert!(text.contains("[DOPPLER:ERROR]"));
    }
}
