//! Bounded hand-off of match results from the recognition loop to whoever
//! polls for them.
//!
//! * `publish` never blocks: a full channel drops its oldest entry.
//! * A result whose name equals the previously published name is dropped,
//!   so a face held in view produces one notification, not one per frame.
//! * `try_take` is destructive (FIFO). `peek_latest` reads the newest entry
//!   without removing it.

use crate::extract::Detection;
use crate::track::TrackId;
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub name: String,
    pub score: f32,
    pub timestamp: DateTime<Utc>,
    pub track_id: TrackId,
    pub detection: Detection,
    /// Saved face crop, when crops are written to disk
    pub image_path: Option<PathBuf>,
}

impl MatchResult {
    pub fn face_image(&self) -> Option<RgbImage> {
        self.detection.face_image()
    }

    /// JPEG-encoded face crop, best effort
    pub fn face_jpeg(&self) -> Option<Vec<u8>> {
        let crop = self.face_image()?;
        let mut bytes = Vec::new();
        match crop.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg) {
            Ok(()) => Some(bytes),
            Err(e) => {
                log::warn!("Failed to encode face crop: {}", e);
                None
            }
        }
    }
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<MatchResult>,
    last_published: Option<String>,
}

pub struct ResultChannel {
    capacity: usize,
    state: Mutex<ChannelState>,
    available: Condvar,
}

impl ResultChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState::default()),
            available: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `result` unless it repeats the previous name. Returns whether
    /// the result was queued.
    pub fn publish(&self, result: MatchResult) -> bool {
        let mut state = self.state();
        if state.last_published.as_deref() == Some(result.name.as_str()) {
            log::trace!("Suppressing repeated result for {}", result.name);
            return false;
        }

        if state.queue.len() >= self.capacity {
            if let Some(dropped) = state.queue.pop_front() {
                log::debug!("Result channel full, dropping {} from {}", dropped.name, dropped.timestamp);
            }
        }

        log::info!("Recognized {} ({:.2})", result.name, result.score);
        state.last_published = Some(result.name.clone());
        state.queue.push_back(result);
        drop(state);

        self.available.notify_one();
        true
    }

    /// Whether a result named `name` would be suppressed by `publish`
    pub fn is_repeat(&self, name: &str) -> bool {
        self.state().last_published.as_deref() == Some(name)
    }

    /// Remove and return the oldest queued result
    pub fn try_take(&self) -> Option<MatchResult> {
        self.state().queue.pop_front()
    }

    /// Wait up to `timeout` for a result, then remove and return it
    pub fn take_timeout(&self, timeout: Duration) -> Option<MatchResult> {
        let state = self.state();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.queue.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.queue.pop_front()
    }

    /// Newest queued result, left in place
    pub fn peek_latest(&self) -> Option<MatchResult> {
        self.state().queue.back().cloned()
    }

    /// Empty the queue and forget the previously published name
    pub fn clear(&self) {
        let mut state = self.state();
        state.queue.clear();
        state.last_published = None;
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().queue.is_empty()
    }
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new(10)
    }
}
