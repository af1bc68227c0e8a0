//! Incremental `text/event-stream` decoder for step events.

use fablestep_core::step::StepStreamEvent;
use serde_json::{Map, Value};

use crate::transport::TransportError;

/// Accumulates bytes and yields one step event per blank-line-terminated block.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Result<StepStreamEvent, TransportError>> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    out.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => self.event = Some(value.to_owned()),
                "data" => self.data.push(value.to_owned()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<Result<StepStreamEvent, TransportError>> {
        let name = self.event.take();
        let data = std::mem::take(&mut self.data);
        if name.is_none() && data.is_empty() {
            return None;
        }
        let name = name.unwrap_or_else(|| "message".to_owned());
        let data = data.join("\n");

        let mut envelope = Map::new();
        envelope.insert("event".into(), Value::String(name.clone()));
        if !data.is_empty() && data != "null" {
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => {
                    envelope.insert("data".into(), value);
                }
                Err(err) => {
                    return Some(Err(TransportError::Protocol(format!(
                        "event {name} carries invalid JSON: {err}"
                    ))));
                }
            }
        }
        Some(
            serde_json::from_value(Value::Object(envelope))
                .map_err(|err| TransportError::Protocol(format!("unexpected event {name}: {err}"))),
        )
    }
}

#[cfg(test)]
mod tests {
    use fablestep_core::step::StepPhase;

    use super::*;

    #[test]
    fn test_decodes_named_events() {
        // Arrange
        let mut decoder = EventDecoder::default();
        let body = "event: phase\ndata: {\"phase\":\"narrating\"}\n\n\
                    event: narrative_delta\ndata: {\"text\":\"The gate \"}\n\n\
                    event: done\ndata: null\n\n";

        // Act
        let events: Vec<StepStreamEvent> = decoder
            .push(body.as_bytes())
            .into_iter()
            .map(Result::unwrap)
            .collect();

        // Assert
        assert_eq!(
            events,
            vec![
                StepStreamEvent::Phase {
                    phase: StepPhase::Narrating
                },
                StepStreamEvent::NarrativeDelta {
                    text: "The gate ".into()
                },
                StepStreamEvent::Done,
            ]
        );
    }

    #[test]
    fn test_blocks_split_across_chunks() {
        let mut decoder = EventDecoder::default();

        assert!(decoder.push(b"event: narrative_del").is_empty());
        assert!(decoder.push(b"ta\ndata: {\"text\":\"x\"}\n").is_empty());
        let events = decoder.push(b"\n");

        assert_eq!(
            events,
            vec![Ok(StepStreamEvent::NarrativeDelta { text: "x".into() })]
        );
    }

    #[test]
    fn test_comments_and_crlf_are_tolerated() {
        let mut decoder = EventDecoder::default();

        let events = decoder.push(b": keep-alive\r\n\r\nevent: done\r\n\r\n");

        assert_eq!(events, vec![Ok(StepStreamEvent::Done)]);
    }

    #[test]
    fn test_unknown_event_is_protocol_error() {
        let mut decoder = EventDecoder::default();

        let events = decoder.push(b"event: surprise\ndata: {}\n\n");

        assert!(matches!(events[0], Err(TransportError::Protocol(_))));
    }
}
