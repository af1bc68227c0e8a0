//! Incremental parser for chat-completion SSE streams.
//!
//! Bytes are buffered until a full line is available, so multi-byte
//! characters split across network chunks decode correctly.

use fablestep_narrative::domain::model::{MALFORMED_OUTPUT, ModelFailure, TRANSPORT_ERROR};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Line buffer over a `text/event-stream` body.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    pending: Vec<u8>,
    done: bool,
}

impl SseBuffer {
    /// Whether `[DONE]` or a malformed line has ended the stream.
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Appends `bytes` and returns the content deltas of every complete line.
    ///
    /// Lines other than `data:` (comments, `event:`, `id:`) are skipped. A
    /// `data:` line that is not a completion chunk ends the stream with
    /// `MALFORMED_OUTPUT`.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ModelFailure>> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.pending.extend_from_slice(bytes);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let Ok(line) = std::str::from_utf8(&line) else {
                out.push(Err(ModelFailure::new(
                    MALFORMED_OUTPUT,
                    "stream line is not valid UTF-8",
                )));
                self.finish();
                break;
            };
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                self.finish();
                break;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    let text = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .unwrap_or_default();
                    if !text.is_empty() {
                        out.push(Ok(text));
                    }
                }
                Err(err) => {
                    out.push(Err(ModelFailure::new(
                        MALFORMED_OUTPUT,
                        format!("unparsable stream chunk: {err}"),
                    )));
                    self.finish();
                    break;
                }
            }
        }
        out
    }

    /// Called when the body ends. A body that ends before `[DONE]` was cut
    /// off and yields a `TRANSPORT_ERROR`.
    pub(crate) fn end(&mut self) -> Option<ModelFailure> {
        if self.done {
            return None;
        }
        self.finish();
        Some(ModelFailure::new(TRANSPORT_ERROR, "stream ended before [DONE]"))
    }

    fn finish(&mut self) {
        self.done = true;
        self.pending.clear();
    }
}
