//! Incremental Server-Sent Events decoder
//!
//! Chunks arrive split at arbitrary byte positions; complete lines are
//! consumed, `event:`/`data:` fields accumulate, a blank line dispatches.

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `message` when the server sent no `event:` field
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_pos);

            if line.is_empty() {
                if let Some(ev) = self.dispatch() {
                    out.push(ev);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        out
    }

    /// Flush a trailing event the server never terminated with a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let mut events = self.push(&format!("{}\n", rest));
            if let Some(ev) = events.pop() {
                return Some(ev);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Pump a streaming response into a channel of decoded events.
/// Returns when the body ends or the receiver goes away.
pub async fn pump(response: reqwest::Response, tx: mpsc::Sender<SseEvent>) -> Result<()> {
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::Transport(format!("Stream read error: {}", e)))?;
        for ev in decoder.push(&String::from_utf8_lossy(&chunk)) {
            if tx.send(ev).await.is_err() {
                return Ok(());
            }
        }
    }
    if let Some(ev) = decoder.finish() {
        let _ = tx.send(ev).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_events_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push("event: st").is_empty());
        assert!(d.push("ep\ndata: {\"a\":").is_empty());
        let events = d.push("1}\n\nevent: done\ndata: {}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent { event: "step".into(), data: "{\"a\":1}".into() },
                SseEvent { event: "done".into(), data: "{}".into() },
            ]
        );
    }

    #[test]
    fn test_defaults_comments_and_crlf() {
        let mut d = SseDecoder::new();
        let events = d.push(": keepalive\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(events, vec![SseEvent { event: "message".into(), data: "[DONE]".into() }]);
    }

    #[test]
    fn test_multiline_data_and_finish() {
        let mut d = SseDecoder::new();
        assert!(d.push("data: one\ndata: two\n").is_empty());
        assert_eq!(d.finish().map(|e| e.data).as_deref(), Some("one\ntwo"));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn test_event_without_data_is_ignored() {
        let mut d = SseDecoder::new();
        assert!(d.push("event: ping\n\n").is_empty());
        let events = d.push("data: x\n\n");
        assert_eq!(events[0].event, "message");
    }
}
