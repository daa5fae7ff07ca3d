//! LRU replacement with a hot/cold split.
//!
//! Frames enter the cold region when they are loaded. A frame accessed again
//! after it has been resident for at least `dwell` is promoted to the head of
//! the hot region; a quick second touch, typical of a single scan, leaves it
//! cold. Frames already in the leading `hot_front_fraction` of the hot region
//! are not moved, so the hottest pages don't churn the list on every access.
//! Victims come from the cold tail first and the hot tail second.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Hot,
    Cold,
}

#[derive(Debug)]
struct Entry {
    region: Region,
    loaded_at: Instant,
}

/// Tracks resident frames by index. The front of each deque is its head
/// (most recently used).
#[derive(Debug)]
pub struct Replacer {
    hot: VecDeque<usize>,
    cold: VecDeque<usize>,
    entries: HashMap<usize, Entry>,
    dwell: Duration,
    hot_front_fraction: f64,
}

impl Replacer {
    pub fn new(dwell: Duration, hot_front_fraction: f64) -> Self {
        Self {
            hot: VecDeque::new(),
            cold: VecDeque::new(),
            entries: HashMap::new(),
            dwell,
            hot_front_fraction,
        }
    }

    fn list(&mut self, region: Region) -> &mut VecDeque<usize> {
        match region {
            Region::Hot => &mut self.hot,
            Region::Cold => &mut self.cold,
        }
    }

    fn unlink(&mut self, frame: usize) -> Option<Entry> {
        let entry = self.entries.remove(&frame)?;
        let list = self.list(entry.region);
        if let Some(pos) = list.iter().position(|&f| f == frame) {
            list.remove(pos);
        }
        Some(entry)
    }

    /// A block was just read into `frame` on demand.
    pub fn record_load(&mut self, frame: usize, now: Instant) {
        self.unlink(frame);
        self.cold.push_front(frame);
        self.entries.insert(
            frame,
            Entry {
                region: Region::Cold,
                loaded_at: now,
            },
        );
    }

    /// A block was read into `frame` speculatively. It sits at the cold tail
    /// until someone actually uses it.
    pub fn record_prefetch(&mut self, frame: usize, now: Instant) {
        self.unlink(frame);
        self.cold.push_back(frame);
        self.entries.insert(
            frame,
            Entry {
                region: Region::Cold,
                loaded_at: now,
            },
        );
    }

    /// A resident frame was pinned again.
    pub fn record_access(&mut self, frame: usize, now: Instant) {
        let Some(entry) = self.entries.get(&frame) else {
            self.record_load(frame, now);
            return;
        };
        let (region, loaded_at) = (entry.region, entry.loaded_at);
        match region {
            Region::Cold => {
                let promote = now.saturating_duration_since(loaded_at) >= self.dwell;
                self.unlink(frame);
                let region = if promote { Region::Hot } else { Region::Cold };
                self.list(region).push_front(frame);
                self.entries.insert(frame, Entry { region, loaded_at });
            }
            Region::Hot => {
                let len = self.hot.len();
                let pos = self.hot.iter().position(|&f| f == frame).unwrap_or(len);
                if (pos as f64) >= self.hot_front_fraction * len as f64 {
                    self.hot.remove(pos);
                    self.hot.push_front(frame);
                }
            }
        }
    }

    pub fn remove(&mut self, frame: usize) {
        self.unlink(frame);
    }

    /// Removes and returns the least valuable frame that `evictable` accepts.
    pub fn victim(&mut self, mut evictable: impl FnMut(usize) -> bool) -> Option<usize> {
        let frame = self
            .cold
            .iter()
            .rev()
            .chain(self.hot.iter().rev())
            .copied()
            .find(|&f| evictable(f))?;
        self.unlink(frame);
        Some(frame)
    }

    pub fn region(&self, frame: usize) -> Option<Region> {
        self.entries.get(&frame).map(|e| e.region)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
