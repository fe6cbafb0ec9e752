use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

/// Ranges closer than this merge into one continuous span.
const MERGE_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("media pipeline is not ready")]
    NotReady,
    #[error("append rejected: {0}")]
    Append(String),
    #[error("player backend error: {0}")]
    Backend(String),
}

/// One continuous span of buffered media, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Media pipeline surface the session drives.
///
/// `buffered` must report sorted, non-overlapping ranges; the scheduler's
/// eviction planning depends on that ordering.
#[async_trait]
pub trait Player: Send + Sync {
    /// Resolves once the pipeline accepts appends.
    async fn wait_until_ready(&self) -> Result<(), PlayerError>;
    fn current_time(&self) -> f64;
    fn is_playing(&self) -> bool;
    async fn play(&self) -> Result<(), PlayerError>;
    async fn pause(&self) -> Result<(), PlayerError>;
    async fn seek(&self, position: f64) -> Result<(), PlayerError>;
    async fn append(&self, payload: Bytes) -> Result<(), PlayerError>;
    async fn remove(&self, start: f64, end: f64) -> Result<(), PlayerError>;
    fn buffered(&self) -> Vec<BufferedRange>;
}

struct PlayheadState {
    position: f64,
    playing: bool,
    anchor: Instant,
    ranges: Vec<BufferedRange>,
    append_cursor: f64,
    appended_segments: usize,
    appended_bytes: u64,
}

/// Wall-clock playhead with a byte sink, for headless runs and tests.
///
/// Appended payloads are opaque, so each append is booked at a monotonically
/// advancing cursor covering `segment_span` seconds. That approximates
/// in-order streaming; tests that need exact ranges prime them directly.
pub struct SimulatedPlayer {
    state: Mutex<PlayheadState>,
    segment_span: f64,
}

impl SimulatedPlayer {
    pub fn new() -> Self {
        // One object at the default cadence of 48 objects per one-second group.
        Self::with_segment_span(1.0 / 48.0)
    }

    /// A player whose every append covers `segment_span` seconds of media.
    pub fn with_segment_span(segment_span: f64) -> Self {
        Self {
            state: Mutex::new(PlayheadState {
                position: 0.0,
                playing: false,
                anchor: Instant::now(),
                ranges: Vec::new(),
                append_cursor: 0.0,
                appended_segments: 0,
                appended_bytes: 0,
            }),
            segment_span,
        }
    }

    pub fn appended_segments(&self) -> usize {
        self.state.lock().appended_segments
    }

    pub fn appended_bytes(&self) -> u64 {
        self.state.lock().appended_bytes
    }
}

impl Default for SimulatedPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Player for SimulatedPlayer {
    async fn wait_until_ready(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    fn current_time(&self) -> f64 {
        let state = self.state.lock();
        if state.playing {
            state.position + state.anchor.elapsed().as_secs_f64()
        } else {
            state.position
        }
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    async fn play(&self) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if !state.playing {
            state.anchor = Instant::now();
            state.playing = true;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if state.playing {
            state.position += state.anchor.elapsed().as_secs_f64();
            state.playing = false;
        }
        Ok(())
    }

    async fn seek(&self, position: f64) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        state.position = position.max(0.0);
        state.anchor = Instant::now();
        Ok(())
    }

    async fn append(&self, payload: Bytes) -> Result<(), PlayerError> {
        if payload.is_empty() {
            return Err(PlayerError::Append("empty media payload".into()));
        }
        let mut state = self.state.lock();
        let start = state.append_cursor;
        let end = start + self.segment_span;
        insert_span(&mut state.ranges, start, end);
        state.append_cursor = end;
        state.appended_segments += 1;
        state.appended_bytes += payload.len() as u64;
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        remove_span(&mut state.ranges, start, end);
        Ok(())
    }

    fn buffered(&self) -> Vec<BufferedRange> {
        self.state.lock().ranges.clone()
    }
}

#[cfg(test)]
impl SimulatedPlayer {
    /// Prime a buffered range without routing bytes through `append`.
    pub fn insert_range(&self, start: f64, end: f64) {
        insert_span(&mut self.state.lock().ranges, start, end);
    }

    /// Park the playhead at `position` without touching the play state.
    pub fn set_position(&self, position: f64) {
        let mut state = self.state.lock();
        state.position = position.max(0.0);
        state.anchor = Instant::now();
    }
}

fn insert_span(ranges: &mut Vec<BufferedRange>, start: f64, end: f64) {
    if end <= start {
        return;
    }
    ranges.push(BufferedRange { start, end });
    ranges.sort_by(|a, b| {
        a.start
            .partial_cmp(&b.start)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut merged: Vec<BufferedRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if range.start <= last.end + MERGE_EPSILON => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}

fn remove_span(ranges: &mut Vec<BufferedRange>, start: f64, end: f64) {
    if end <= start {
        return;
    }
    let mut updated = Vec::with_capacity(ranges.len() + 1);
    for range in ranges.drain(..) {
        if range.end <= start || range.start >= end {
            updated.push(range);
            continue;
        }
        if range.start < start {
            updated.push(BufferedRange {
                start: range.start,
                end: start,
            });
        }
        if range.end > end {
            updated.push(BufferedRange {
                start: end,
                end: range.end,
            });
        }
    }
    *ranges = updated;
}
