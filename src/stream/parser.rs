use crate::dify::DecodedEvent;
use crate::error::AppError;

/// Payload that marks normal end of stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One `data:` payload, tagged with the most recent `event:` line of its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

/// Longest line the framer will buffer. Workflow outputs arrive on one line,
/// so this is generous.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Splits an event-stream byte sequence into frames.
///
/// Incomplete lines are held until their newline arrives, so the output does
/// not depend on where chunk boundaries fall. A newline byte never occurs
/// inside a multi-byte UTF-8 sequence, so splitting on raw bytes is safe.
/// A line longer than `max_line` is dropped whole, wherever it was split.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    scanned: usize,
    event_hint: Option<String>,
    max_line: usize,
    /// Inside an oversized line; bytes are dropped up to the next newline.
    discarding: bool,
    oversized: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            event_hint: None,
            max_line,
            discarding: false,
            oversized: 0,
        }
    }

    /// Number of oversized lines dropped so far.
    pub fn oversized(&self) -> usize {
        self.oversized
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.discarding = false;
                    chunk = &chunk[i + 1..];
                }
                None => return frames,
            }
        }

        self.buf.extend_from_slice(chunk);
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buf[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            if end - start > self.max_line {
                self.drop_line(end - start);
            } else {
                let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
                self.push_line(&line, &mut frames);
            }
            start = end + 1;
            cursor = start;
        }
        self.buf.drain(..start);
        if self.buf.len() > self.max_line {
            self.drop_line(self.buf.len());
            self.buf.clear();
            self.discarding = true;
        }
        self.scanned = self.buf.len();
        frames
    }

    fn drop_line(&mut self, len: usize) {
        self.oversized += 1;
        let err = AppError::UpstreamProtocol(format!("line exceeds {} bytes", self.max_line));
        tracing::warn!(buffered = len, "[stream] dropping line: {err}");
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        self.discarding = false;
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            self.scanned = 0;
            self.push_line(&line, &mut frames);
        }
        frames
    }

    fn push_line(&mut self, line: &str, out: &mut Vec<Frame>) {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            self.event_hint = None;
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            out.push(Frame {
                event: self.event_hint.clone(),
                data: rest.trim().to_string(),
            });
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event_hint = Some(rest.trim().to_string());
        }
        // `id:`, `retry:` and `:` comment lines carry nothing we use.
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamItem {
    Event(DecodedEvent),
    Done,
}

/// Provider stream parser: frames plus per-frame decoding.
///
/// A frame that fails to decode is logged and dropped; it never ends the stream.
#[derive(Debug, Default)]
pub struct ProviderStreamParser {
    framer: LineFramer,
    skipped: usize,
}

impl ProviderStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self { framer: LineFramer::with_max_line(max_line), skipped: 0 }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<UpstreamItem> {
        let frames = self.framer.feed(chunk);
        self.decode(frames)
    }

    pub fn finish(&mut self) -> Vec<UpstreamItem> {
        let frames = self.framer.finish();
        self.decode(frames)
    }

    /// Number of malformed frames and oversized lines dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped + self.framer.oversized()
    }

    fn decode(&mut self, frames: Vec<Frame>) -> Vec<UpstreamItem> {
        let mut items = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.is_done() {
                items.push(UpstreamItem::Done);
                continue;
            }
            match DecodedEvent::decode(&frame.data) {
                Ok(event) => items.push(UpstreamItem::Event(event)),
                Err(err) => {
                    self.skipped += 1;
                    tracing::warn!(
                        payload_len = frame.data.len(),
                        "[stream] skipping frame: {err}"
                    );
                }
            }
        }
        items
    }
}
