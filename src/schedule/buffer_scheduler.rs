//! Two-dimensional layout of placed buffers within one memory level.
//!
//! Each placement is a rectangle: its lifetime (a range of leaf timestamps)
//! on one axis and its byte range on the other. Rectangles that are live at
//! the same time must not share bytes. Items are placed largest first at the
//! lowest fitting offset; when an item has no room, earlier choices are
//! revisited.

use crate::utils::errors::{PackingError, PackingErrorKind};
use log::trace;

/// One buffer to lay out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackItem {
    /// Size in bytes
    pub bytes: i64,
    /// First and last leaf timestamp the buffer is live (inclusive)
    pub lifetime: (usize, usize),
}

impl PackItem {
    /// Create an item.
    pub fn new(bytes: i64, lifetime: (usize, usize)) -> Self {
        Self { bytes, lifetime }
    }

    fn overlaps_in_time(&self, other: &PackItem) -> bool {
        self.lifetime.0 <= other.lifetime.1 && other.lifetime.0 <= self.lifetime.1
    }
}

/// First-fit packer with backtracking for one memory level.
#[derive(Debug, Clone)]
pub struct BufferScheduler {
    level: usize,
    capacity: i64,
    max_steps: usize,
}

impl BufferScheduler {
    /// Create a packer for `level` holding `capacity` bytes.
    pub fn new(level: usize, capacity: i64) -> Self {
        Self { level, capacity, max_steps: 100_000 }
    }

    /// Bound the number of placement attempts.
    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    /// Byte offset of every item, in input order.
    pub fn pack(&self, items: &[PackItem]) -> Result<Vec<i64>, PackingError> {
        if let Some(big) = items.iter().find(|i| i.bytes > self.capacity) {
            return Err(PackingError {
                message: format!("buffer of {} bytes exceeds capacity {}", big.bytes, self.capacity),
                level: self.level,
                kind: PackingErrorKind::BufferTooLarge,
            });
        }

        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by_key(|&i| (std::cmp::Reverse(items[i].bytes), items[i].lifetime.0, i));

        let mut offsets: Vec<Option<i64>> = vec![None; items.len()];
        let mut steps = 0;
        if self.place(items, &order, 0, &mut offsets, &mut steps) {
            trace!("packed {} buffers at level {} in {} steps", items.len(), self.level, steps);
            return Ok(offsets.into_iter().map(|o| o.unwrap_or(0)).collect());
        }

        let peak = peak_usage(items);
        Err(PackingError {
            message: format!(
                "no overlap-free layout of {} buffers (peak {} bytes, capacity {}, {} steps)",
                items.len(),
                peak,
                self.capacity,
                steps
            ),
            level: self.level,
            kind: PackingErrorKind::NoFit,
        })
    }

    fn place(
        &self,
        items: &[PackItem],
        order: &[usize],
        k: usize,
        offsets: &mut [Option<i64>],
        steps: &mut usize,
    ) -> bool {
        let Some(&i) = order.get(k) else {
            return true;
        };
        let item = items[i];
        let neighbours: Vec<(i64, i64)> = order[..k]
            .iter()
            .filter(|&&j| items[j].overlaps_in_time(&item))
            .filter_map(|&j| offsets[j].map(|o| (o, o + items[j].bytes)))
            .collect();

        let mut candidates: Vec<i64> = std::iter::once(0).chain(neighbours.iter().map(|&(_, end)| end)).collect();
        candidates.sort_unstable();
        candidates.dedup();

        for offset in candidates {
            *steps += 1;
            if *steps > self.max_steps {
                return false;
            }
            let end = offset + item.bytes;
            if end > self.capacity || neighbours.iter().any(|&(lo, hi)| offset < hi && lo < end) {
                continue;
            }
            offsets[i] = Some(offset);
            if self.place(items, order, k + 1, offsets, steps) {
                return true;
            }
            offsets[i] = None;
        }
        false
    }
}

/// Largest total size live at one timestamp.
pub fn peak_usage(items: &[PackItem]) -> i64 {
    let last = items.iter().map(|i| i.lifetime.1).max().unwrap_or(0);
    (0..=last)
        .map(|t| {
            items.iter()
                .filter(|i| i.lifetime.0 <= t && t <= i.lifetime.1)
                .map(|i| i.bytes)
                .sum()
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(items: &[PackItem], offsets: &[i64], capacity: i64) {
        for (i, a) in items.iter().enumerate() {
            assert!(offsets[i] >= 0 && offsets[i] + a.bytes <= capacity);
            for (j, b) in items.iter().enumerate().skip(i + 1) {
                if a.overlaps_in_time(b) {
                    let (ai, bj) = (offsets[i], offsets[j]);
                    assert!(ai + a.bytes <= bj || bj + b.bytes <= ai, "items {} and {} collide", i, j);
                }
            }
        }
    }

    #[test]
    fn test_disjoint_lifetimes_share_space() {
        let items = [PackItem::new(64, (0, 0)), PackItem::new(64, (1, 1))];
        let offsets = BufferScheduler::new(0, 64).pack(&items).unwrap();
        assert_eq!(offsets, vec![0, 0]);
    }

    #[test]
    fn test_overlapping_lifetimes_stack() {
        let items = [PackItem::new(32, (0, 1)), PackItem::new(64, (1, 2)), PackItem::new(32, (2, 2))];
        let offsets = BufferScheduler::new(0, 128).pack(&items).unwrap();
        assert_eq!(offsets[1], 0);
        assert_disjoint(&items, &offsets, 128);
    }

    #[test]
    fn test_tight_layout() {
        // the peak at timestamp 1 fills the level exactly
        let items = [
            PackItem::new(48, (0, 1)),
            PackItem::new(48, (1, 2)),
            PackItem::new(32, (0, 0)),
            PackItem::new(32, (2, 2)),
            PackItem::new(16, (0, 2)),
        ];
        assert_eq!(peak_usage(&items), 112);
        let offsets = BufferScheduler::new(1, 112).pack(&items).unwrap();
        assert_disjoint(&items, &offsets, 112);
    }

    #[test]
    fn test_step_budget() {
        let items = [PackItem::new(16, (0, 1)), PackItem::new(16, (1, 2))];
        assert!(BufferScheduler::new(0, 32).pack(&items).is_ok());
        let err = BufferScheduler::new(0, 32).with_max_steps(1).pack(&items).unwrap_err();
        assert_eq!(err.kind, PackingErrorKind::NoFit);
    }

    #[test]
    fn test_errors() {
        let err = BufferScheduler::new(0, 16).pack(&[PackItem::new(32, (0, 0))]).unwrap_err();
        assert_eq!(err.kind, PackingErrorKind::BufferTooLarge);

        let items = [PackItem::new(16, (0, 1)), PackItem::new(16, (1, 2)), PackItem::new(16, (0, 2))];
        let err = BufferScheduler::new(2, 32).pack(&items).unwrap_err();
        assert_eq!(err.kind, PackingErrorKind::NoFit);
        assert_eq!(err.level, 2);
        assert_eq!(peak_usage(&items), 48);
    }
}
