//! Streaming response assembly
//!
//! Turns a sequence of text deltas into platform-sized chunks. The
//! assembler is a pure state machine: callers feed deltas, ask whether a
//! flush is due, and carry out the returned [`Emission`]s against the chat
//! platform.

use std::time::Duration;

use tokio::time::Instant;

/// Hard limit on characters per delivered message
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Position the backward newline scan starts from
pub const SPLIT_SCAN_START: usize = 1950;

/// Where chunks may be split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    max_chars: usize,
    scan_from: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self::new(MAX_CHUNK_CHARS, SPLIT_SCAN_START)
    }
}

impl ChunkPolicy {
    /// `scan_from` is clamped below `max_chars` so a newline split never
    /// produces an oversized head.
    pub fn new(max_chars: usize, scan_from: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            scan_from: scan_from.min(max_chars - 1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Split `text` into a completed head and the remainder, or `None` if it
    /// already fits.
    ///
    /// The head ends with the last newline found scanning back from
    /// `scan_from` to position 1. Without one, the head is exactly
    /// `max_chars` characters.
    pub fn split<'a>(&self, text: &'a str) -> Option<(&'a str, &'a str)> {
        if text.chars().count() <= self.max_chars {
            return None;
        }

        let window_start = byte_offset(text, 1);
        let window_end = byte_offset(text, self.scan_from + 1);
        if let Some(pos) = text[window_start..window_end].rfind('\n') {
            return Some(text.split_at(window_start + pos + 1));
        }

        Some(text.split_at(byte_offset(text, self.max_chars)))
    }

    /// Split a complete text into deliverable chunks.
    pub fn chunks(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut rest = text;
        while let Some((head, tail)) = self.split(rest) {
            chunks.push(head.to_string());
            rest = tail;
        }
        if !rest.is_empty() {
            chunks.push(rest.to_string());
        }
        chunks
    }
}

/// Byte offset of the character at `char_pos`, or the text length past the end
fn byte_offset(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map_or(text.len(), |(offset, _)| offset)
}

/// Which message an emission goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Edit the currently open message
    Current,
    /// Send a new message, which becomes the open one
    New,
}

/// One delivery operation produced by a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub target: Target,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Accumulating,
    Flushing,
    Done,
}

/// Per-turn stream assembly state
#[derive(Debug)]
pub struct StreamAssembler {
    policy: ChunkPolicy,
    interval: Duration,
    /// Text of the currently open message
    buffer: String,
    buffer_chars: usize,
    /// Everything the model produced this turn
    response: String,
    last_flush: Instant,
    /// Buffer changed since the last flush
    dirty: bool,
    state: AssemblerState,
}

impl StreamAssembler {
    pub fn new(policy: ChunkPolicy, interval: Duration, now: Instant) -> Self {
        Self {
            policy,
            interval,
            buffer: String::new(),
            buffer_chars: 0,
            response: String::new(),
            last_flush: now,
            dirty: false,
            state: AssemblerState::Accumulating,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Full response text accumulated so far
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Text of the currently open message
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Append a delta. Ignored once finished.
    pub fn feed(&mut self, delta: &str) {
        if self.state == AssemblerState::Done || delta.is_empty() {
            return;
        }
        self.buffer.push_str(delta);
        self.buffer_chars += delta.chars().count();
        self.response.push_str(delta);
        self.dirty = true;
    }

    /// Earliest instant at which [`maybe_flush`](Self::maybe_flush) flushes
    /// on time alone, if anything is pending. The interval must be strictly
    /// exceeded, so this is one millisecond past it.
    pub fn next_flush_at(&self) -> Option<Instant> {
        (self.dirty && self.state != AssemblerState::Done)
            .then(|| self.last_flush + self.interval + Duration::from_millis(1))
    }

    /// Flush if the buffer overflowed or the interval elapsed since the
    /// last flush.
    pub fn maybe_flush(&mut self, now: Instant) -> Vec<Emission> {
        if self.state == AssemblerState::Done || !self.dirty {
            return Vec::new();
        }
        let overflowed = self.buffer_chars > self.policy.max_chars();
        let elapsed = now.saturating_duration_since(self.last_flush) > self.interval;
        if overflowed || elapsed {
            self.flush(now)
        } else {
            Vec::new()
        }
    }

    /// Flush unconditionally.
    ///
    /// Every completed head goes to the open message, and each following
    /// piece opens a new one. The last piece stays in the buffer so later
    /// deltas keep extending it.
    pub fn flush(&mut self, now: Instant) -> Vec<Emission> {
        if self.state == AssemblerState::Done {
            return Vec::new();
        }
        self.state = AssemblerState::Flushing;

        let mut emissions = Vec::new();
        let mut target = Target::Current;
        while let Some((head, rest)) = self.policy.split(&self.buffer) {
            emissions.push(Emission {
                target,
                text: head.to_string(),
            });
            target = Target::New;
            self.buffer = rest.to_string();
        }
        self.buffer_chars = self.buffer.chars().count();
        emissions.push(Emission {
            target,
            text: self.buffer.clone(),
        });

        self.last_flush = now;
        self.dirty = false;
        self.state = AssemblerState::Accumulating;
        emissions
    }

    /// Append the summary line and perform the final flush.
    pub fn finish(&mut self, summary: &str, now: Instant) -> Vec<Emission> {
        if self.state == AssemblerState::Done {
            return Vec::new();
        }
        if !summary.is_empty() {
            let footer = format!("\n\n{}", summary);
            self.buffer_chars += footer.chars().count();
            self.buffer.push_str(&footer);
        }
        let emissions = self.flush(now);
        self.state = AssemblerState::Done;
        emissions
    }
}
