//! Time windows: assignment, watermarks, and per-window state
//!
//! An aggregate node declares a [`WindowAssigner`]: tumbling windows tile the
//! timeline without overlap, sliding windows advance by `slide` and overlap
//! while `slide < size`. Items are assigned by timestamp (event time when the
//! node supplies an extractor, arrival time otherwise) and folded into
//! per-`(key, window)` accumulators held in a [`WindowStore`].
//!
//! The event-time watermark advances monotonically per key: it is the
//! maximum timestamp observed for that key so far. A key's window closes
//! once the key's watermark passes the window end plus the allowed
//! lateness; items older than `watermark - allowed_lateness` are dropped
//! and counted rather than folded, so a closed window never reopens. End of
//! input closes everything that remains.

use chrono::{DateTime, Utc};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::lineage::LineagePacket;

/// Tracing target for windowing.
pub(crate) const TRACING_TARGET: &str = "conflux_core::window";

/// Closed-open time span `[start, end)` a window covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WindowBounds {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    fn from_millis(start: i64, end: i64) -> Option<Self> {
        Some(Self {
            start: DateTime::from_timestamp_millis(start)?,
            end: DateTime::from_timestamp_millis(end)?,
        })
    }
}

/// Window assignment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowMode {
    Tumbling { size_ms: i64 },
    Sliding { size_ms: i64, slide_ms: i64 },
}

/// Assigns items to time windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    mode: WindowMode,
    lateness_ms: i64,
}

impl WindowAssigner {
    /// Non-overlapping windows of `size` tiling the timeline.
    pub fn tumbling(size: Duration) -> Self {
        Self {
            mode: WindowMode::Tumbling {
                size_ms: size.as_millis() as i64,
            },
            lateness_ms: 0,
        }
    }

    /// Overlapping windows of `size`, a new one every `slide`.
    pub fn sliding(size: Duration, slide: Duration) -> Self {
        Self {
            mode: WindowMode::Sliding {
                size_ms: size.as_millis() as i64,
                slide_ms: slide.as_millis() as i64,
            },
            lateness_ms: 0,
        }
    }

    /// Accept items up to `lateness` behind the watermark.
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.lateness_ms = lateness.as_millis() as i64;
        self
    }

    /// True when this assigner produces overlapping windows.
    pub fn is_sliding(&self) -> bool {
        matches!(self.mode, WindowMode::Sliding { .. })
    }

    /// Structural check: positive sizes, and `slide < size` for sliding.
    pub(crate) fn check(&self) -> Result<(), String> {
        match self.mode {
            WindowMode::Tumbling { size_ms } if size_ms <= 0 => {
                Err("tumbling window size must be positive".into())
            }
            WindowMode::Sliding { size_ms, slide_ms } if size_ms <= 0 || slide_ms <= 0 => {
                Err("sliding window size and slide must be positive".into())
            }
            WindowMode::Sliding { size_ms, slide_ms } if slide_ms >= size_ms => {
                Err("sliding window slide must be smaller than its size".into())
            }
            _ => Ok(()),
        }
    }

    /// Windows containing the instant `t`.
    pub fn assign(&self, t: DateTime<Utc>) -> SmallVec<[WindowBounds; 2]> {
        let ms = t.timestamp_millis();
        let mut windows = SmallVec::new();
        match self.mode {
            WindowMode::Tumbling { size_ms } => {
                let start = ms.div_euclid(size_ms) * size_ms;
                if let Some(w) = WindowBounds::from_millis(start, start + size_ms) {
                    windows.push(w);
                }
            }
            WindowMode::Sliding { size_ms, slide_ms } => {
                let mut start = ms.div_euclid(slide_ms) * slide_ms;
                while start + size_ms > ms {
                    if let Some(w) = WindowBounds::from_millis(start, start + size_ms) {
                        windows.push(w);
                    }
                    start -= slide_ms;
                }
                windows.reverse();
            }
        }
        windows
    }
}

/// One closed window ready for emission.
pub(crate) struct ClosedWindow<K, A> {
    pub key: K,
    pub bounds: WindowBounds,
    pub acc: A,
    pub contributors: Vec<LineagePacket>,
}

struct Slot<A> {
    bounds: WindowBounds,
    acc: Option<A>,
    contributors: Vec<LineagePacket>,
}

/// Per-`(key, window)` accumulator state with watermark-driven closing.
pub(crate) struct WindowStore<K, A> {
    assigner: WindowAssigner,
    slots: HashMap<(K, i64), Slot<A>>,
    watermarks: HashMap<K, i64>,
    late_drops: u64,
}

impl<K: Eq + Hash + Clone, A> WindowStore<K, A> {
    pub(crate) fn new(assigner: WindowAssigner) -> Self {
        Self {
            assigner,
            slots: HashMap::new(),
            watermarks: HashMap::new(),
            late_drops: 0,
        }
    }

    /// Late-check `t` against the key's watermark, then advance it.
    ///
    /// Returns the windows to fold into, or `None` when the item is late and
    /// was dropped.
    pub(crate) fn admit(
        &mut self,
        key: &K,
        t: DateTime<Utc>,
    ) -> Option<SmallVec<[WindowBounds; 2]>> {
        let ms = t.timestamp_millis();
        if let Some(wm) = self.watermarks.get(key) {
            if ms < *wm - self.assigner.lateness_ms {
                self.late_drops += 1;
                return None;
            }
        }
        let watermark = self.watermarks.entry(key.clone()).or_insert(ms);
        *watermark = (*watermark).max(ms);
        Some(self.assigner.assign(t))
    }

    /// Fold one item occurrence into a `(key, window)` accumulator.
    pub(crate) fn fold_into<F>(
        &mut self,
        key: K,
        bounds: WindowBounds,
        lineage: Option<&LineagePacket>,
        fold: F,
    ) where
        F: FnOnce(Option<A>) -> A,
    {
        let slot = self
            .slots
            .entry((key, bounds.start.timestamp_millis()))
            .or_insert_with(|| Slot {
                bounds,
                acc: None,
                contributors: Vec::new(),
            });
        slot.acc = Some(fold(slot.acc.take()));
        if let Some(packet) = lineage {
            slot.contributors.push(packet.clone());
        }
    }

    /// Windows whose end (plus lateness) their key's watermark has passed.
    ///
    /// Results are ordered by window start; per-key order within a start is
    /// unspecified.
    pub(crate) fn close_ripe(&mut self) -> Vec<ClosedWindow<K, A>> {
        let lateness = self.assigner.lateness_ms;
        let watermarks = &self.watermarks;
        let ripe: Vec<(K, i64)> = self
            .slots
            .iter()
            .filter(|((key, _), slot)| {
                watermarks
                    .get(key)
                    .is_some_and(|wm| slot.bounds.end.timestamp_millis() + lateness <= *wm)
            })
            .map(|(k, _)| k.clone())
            .collect();
        self.take_slots(ripe)
    }

    /// Close everything; called at end of input.
    pub(crate) fn drain_all(&mut self) -> Vec<ClosedWindow<K, A>> {
        let keys: Vec<(K, i64)> = self.slots.keys().cloned().collect();
        self.take_slots(keys)
    }

    /// Items dropped for arriving behind the watermark.
    pub(crate) fn late_drops(&self) -> u64 {
        self.late_drops
    }

    fn take_slots(&mut self, mut keys: Vec<(K, i64)>) -> Vec<ClosedWindow<K, A>> {
        keys.sort_by_key(|(_, start)| *start);
        keys.into_iter()
            .filter_map(|key| {
                self.slots.remove(&key).and_then(|slot| {
                    slot.acc.map(|acc| ClosedWindow {
                        key: key.0,
                        bounds: slot.bounds,
                        acc,
                        contributors: slot.contributors,
                    })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_tumbling_assignment_tiles() {
        let assigner = WindowAssigner::tumbling(Duration::from_secs(60));
        let windows = assigner.assign(at(90_000));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, at(60_000));
        assert_eq!(windows[0].end, at(120_000));

        // Boundary instant belongs to the window it starts.
        let windows = assigner.assign(at(60_000));
        assert_eq!(windows[0].start, at(60_000));
    }

    #[test]
    fn test_sliding_assignment_membership() {
        let assigner = WindowAssigner::sliding(Duration::from_secs(10), Duration::from_secs(5));
        let windows = assigner.assign(at(12_000));
        // t=12s belongs to [5,15) and [10,20).
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, at(5_000));
        assert_eq!(windows[1].start, at(10_000));
        for w in &windows {
            assert!(w.start <= at(12_000) && at(12_000) < w.end);
        }
    }

    #[test]
    fn test_assigner_check() {
        assert!(WindowAssigner::tumbling(Duration::from_secs(60)).check().is_ok());
        assert!(
            WindowAssigner::sliding(Duration::from_secs(10), Duration::from_secs(10))
                .check()
                .is_err()
        );
        assert!(WindowAssigner::tumbling(Duration::ZERO).check().is_err());
    }

    #[test]
    fn test_watermark_closes_windows() {
        let mut store: WindowStore<&str, i64> =
            WindowStore::new(WindowAssigner::tumbling(Duration::from_secs(60)));
        for (t, v) in [(10_000, 1), (20_000, 2)] {
            let windows = store.admit(&"a", at(t)).unwrap();
            for w in windows {
                store.fold_into("a", w, None, |acc| acc.unwrap_or(0) + v);
            }
        }
        // Nothing ripe while the watermark sits inside the window.
        assert!(store.close_ripe().is_empty());

        let windows = store.admit(&"a", at(61_000)).unwrap();
        for w in windows {
            store.fold_into("a", w, None, |acc| acc.unwrap_or(0) + 10);
        }
        let closed = store.close_ripe();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].acc, 3);
        assert_eq!(closed[0].bounds.start, at(0));

        let rest = store.drain_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].acc, 10);
    }

    #[test]
    fn test_late_items_dropped_and_counted() {
        let mut store: WindowStore<&str, i64> =
            WindowStore::new(WindowAssigner::tumbling(Duration::from_secs(60)));
        store.admit(&"a", at(120_000)).unwrap();
        assert!(store.admit(&"a", at(10_000)).is_none());
        assert_eq!(store.late_drops(), 1);
        // A different key has its own watermark and is not late.
        assert!(store.admit(&"b", at(10_000)).is_some());

        // With lateness, the same gap is tolerated.
        let mut store: WindowStore<&str, i64> = WindowStore::new(
            WindowAssigner::tumbling(Duration::from_secs(60))
                .with_allowed_lateness(Duration::from_secs(200)),
        );
        store.admit(&"a", at(120_000)).unwrap();
        assert!(store.admit(&"a", at(10_000)).is_some());
        assert_eq!(store.late_drops(), 0);
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let mut store: WindowStore<&str, ()> =
            WindowStore::new(WindowAssigner::tumbling(Duration::from_secs(60)).with_allowed_lateness(Duration::from_secs(30)));
        store.admit(&"a", at(100_000)).unwrap();
        // An in-lateness older item must not move the watermark backwards.
        store.admit(&"a", at(80_000)).unwrap();
        assert!(store.admit(&"a", at(60_000)).is_none());
    }
}
