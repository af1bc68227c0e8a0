//! Scrubbing of generated prose.
//!
//! Removes marker tokens (`[[...]]`, `<|...|>`, `{{...}}`), qualified
//! references such as `node:hall`, labelled scores (`confidence: 0.92`,
//! `score=0.4`), and rewrites identifier-shaped pack ids
//! (`light_the_beacon`) into plain words. Numbers in prose stay.
//!
//! Scrubbing works on whitespace-separated tokens once markers are gone, and
//! the only state carried between tokens is whether a score label was just
//! dropped. Text scrubbed in whitespace-terminated segments with that flag
//! carried over is identical to the same text scrubbed whole.
//! [`StreamScrubber`] relies on that.

use std::collections::BTreeSet;

const MARKERS: [(&str, &str); 3] = [("[[", "]]"), ("<|", "|>"), ("{{", "}}")];

const REFERENCE_PREFIXES: &[&str] = &[
    "node", "choice", "intent", "target", "executor", "quest", "stage", "milestone", "event",
    "ending", "id",
];

const SCORE_LABELS: &[&str] = &["confidence", "score"];

const EDGE_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '"', '\'', '(', ')', '*', '`'];

/// Scrubber for one story pack.
#[derive(Debug, Clone, Default)]
pub struct Scrubber {
    ids: BTreeSet<String>,
}

impl Scrubber {
    /// Creates a scrubber for the given internal ids. Only identifier-shaped
    /// ids (containing `_`, `-`, `@` or a digit) are rewritten; plain words
    /// are indistinguishable from prose.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: ids.into_iter().filter(|id| is_identifier_shaped(id)).collect(),
        }
    }

    /// Scrubs a complete text.
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        self.scrub_segment(text, &mut false)
    }

    /// Scrubs one whitespace-terminated segment. `after_label` is set when
    /// the segment ends right after a dropped score label.
    fn scrub_segment(&self, text: &str, after_label: &mut bool) -> String {
        let stripped = strip_markers(text);
        let mut out = String::with_capacity(stripped.len());
        let mut token = String::new();
        for c in stripped.chars() {
            if c.is_whitespace() {
                self.push_token(&mut out, &token, after_label);
                token.clear();
                out.push(c);
            } else {
                token.push(c);
            }
        }
        self.push_token(&mut out, &token, after_label);
        out
    }

    fn push_token(&self, out: &mut String, token: &str, after_label: &mut bool) {
        if token.is_empty() {
            return;
        }
        let labelled = std::mem::take(after_label);
        let core = token.trim_matches(EDGE_PUNCTUATION);
        if core.is_empty() {
            out.push_str(token);
            return;
        }
        let lowered = core.to_ascii_lowercase();
        if SCORE_LABELS.contains(&lowered.as_str()) {
            *after_label = true;
            return;
        }
        if is_reference(core) || is_labelled_score(&lowered) || (labelled && is_score(core)) {
            return;
        }
        if self.ids.contains(core) {
            let start = token.find(core).unwrap_or(0);
            out.push_str(&token[..start]);
            out.push_str(&core.replace(['_', '-', '@'], " "));
            out.push_str(&token[start + core.len()..]);
            return;
        }
        out.push_str(token);
    }
}

fn is_identifier_shaped(id: &str) -> bool {
    id.chars().any(|c| c == '_' || c == '-' || c == '@' || c.is_ascii_digit())
}

fn is_reference(core: &str) -> bool {
    let Some((prefix, rest)) = core.split_once([':', '=']) else {
        return false;
    };
    !rest.is_empty() && REFERENCE_PREFIXES.contains(&prefix.to_ascii_lowercase().as_str())
}

/// A label and its value in one token, such as `confidence=0.81`.
fn is_labelled_score(lowered: &str) -> bool {
    lowered
        .split_once([':', '='])
        .is_some_and(|(label, _)| SCORE_LABELS.contains(&label))
}

/// A decimal fraction in `[0, 1]` such as `0.87` or `1.0`.
fn is_score(token: &str) -> bool {
    token.contains('.')
        && token.parse::<f64>().is_ok_and(|v| (0.0..=1.0).contains(&v))
}

/// Removes every complete marker span; an unterminated marker runs to the end.
fn strip_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some((start, open, close)) = next_marker(rest) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => rest = &after_open[end + close.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn next_marker(text: &str) -> Option<(usize, &'static str, &'static str)> {
    MARKERS
        .iter()
        .filter_map(|(open, close)| text.find(open).map(|at| (at, *open, *close)))
        .min_by_key(|(at, _, _)| *at)
}

/// Byte offset of the first marker opener in `text` without a closer.
fn unclosed_marker(text: &str) -> Option<usize> {
    let mut offset = 0;
    let mut rest = text;
    while let Some((start, open, close)) = next_marker(rest) {
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                let consumed = start + open.len() + end + close.len();
                offset += consumed;
                rest = &rest[consumed..];
            }
            None => return Some(offset + start),
        }
    }
    None
}

/// Scrubs narration as it streams.
///
/// Text is held back until a whitespace boundary outside any open marker, so
/// the concatenation of everything emitted equals scrubbing the whole text.
#[derive(Debug)]
pub struct StreamScrubber<'a> {
    scrubber: &'a Scrubber,
    pending: String,
    after_label: bool,
}

impl<'a> StreamScrubber<'a> {
    /// Starts a stream.
    #[must_use]
    pub fn new(scrubber: &'a Scrubber) -> Self {
        Self {
            scrubber,
            pending: String::new(),
            after_label: false,
        }
    }

    /// Accepts a chunk and returns the scrubbed text that is safe to emit.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let cut = self.safe_cut();
        if cut == 0 {
            return String::new();
        }
        let ready: String = self.pending.drain(..cut).collect();
        self.scrubber.scrub_segment(&ready, &mut self.after_label)
    }

    /// Flushes whatever is held back.
    pub fn finish(mut self) -> String {
        self.scrubber.scrub_segment(&self.pending, &mut self.after_label)
    }

    fn safe_cut(&self) -> usize {
        let mut cut = last_boundary(&self.pending, self.pending.len());
        if let Some(open) = unclosed_marker(&self.pending[..cut]) {
            cut = last_boundary(&self.pending, open);
        }
        cut
    }
}

/// Offset just past the last whitespace character before `limit`.
fn last_boundary(text: &str, limit: usize) -> usize {
    text[..limit]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(0, |(at, c)| at + c.len_utf8())
}
