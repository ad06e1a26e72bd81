use std::collections::VecDeque;

/// Splits an event-stream body into `data:` payloads as chunks arrive.
///
/// Chunks may end anywhere, including inside a UTF-8 sequence; bytes are
/// only decoded once a full line is available.
#[derive(Debug, Default)]
pub struct SseFrameReader {
    pending: Vec<u8>,
    data_lines: Vec<String>,
    frames: VecDeque<String>,
}

impl SseFrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<_>>();
            self.accept_line(&line[..line.len() - 1]);
        }
    }

    /// Flushes a trailing unterminated line and any open frame at end of body.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.accept_line(&line);
        }
        self.emit_frame();
    }

    pub fn next_frame(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    fn accept_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            self.emit_frame();
            return;
        }
        // `event:` names are repeated inside the JSON payload; comments and ids are unused.
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }
    }

    fn emit_frame(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }
        let frame = self.data_lines.join("\n");
        self.data_lines.clear();
        self.frames.push_back(frame);
    }
}
