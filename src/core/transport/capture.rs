//! Bounded output capture.
//!
//! Each stream keeps only its most recent bytes. Dropped bytes are never
//! silent: the captured text starts with a truncation marker.

use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedText {
    pub text: String,
    pub truncated: bool,
    pub dropped_bytes: u64,
}

impl CapturedText {
    /// Capture an in-memory string under the same cap a live stream would get.
    pub fn from_str_capped(value: &str, cap: usize) -> Self {
        let mut buffer = TailBuffer::new(cap);
        buffer.push(value.as_bytes());
        buffer.snapshot()
    }
}

#[derive(Debug)]
pub struct TailBuffer {
    cap: usize,
    bytes: VecDeque<u8>,
    dropped: u64,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            bytes: VecDeque::with_capacity(cap.min(8192)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.cap == 0 {
            self.dropped += chunk.len() as u64;
            return;
        }

        if chunk.len() >= self.cap {
            self.dropped += (self.bytes.len() + chunk.len() - self.cap) as u64;
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.cap..]);
            return;
        }

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.bytes.extend(chunk);
    }

    pub fn snapshot(&self) -> CapturedText {
        let (front, back) = self.bytes.as_slices();
        let mut raw = Vec::with_capacity(self.bytes.len());
        raw.extend_from_slice(front);
        raw.extend_from_slice(back);
        let body = String::from_utf8_lossy(&raw);

        if self.dropped == 0 {
            return CapturedText {
                text: body.into_owned(),
                truncated: false,
                dropped_bytes: 0,
            };
        }

        CapturedText {
            text: format!("[... {} bytes truncated ...]\n{}", self.dropped, body),
            truncated: true,
            dropped_bytes: self.dropped,
        }
    }
}
