//! Position-indexed cache maintenance
//!
//! Operations over the engine's per-sequence attention state. Only sequence 0
//! is ever used. Positions are always re-queried from the store before a
//! decision; nothing here keeps its own copy of the occupied range.

use std::ops::Range;

use crate::error::{InferenceError, Result};

/// Offset into the engine's per-sequence state
pub type Position = u32;

/// Occupancy ratio above which compaction is allowed to run
pub const COMPACTION_THRESHOLD: f32 = 0.8;

/// Default fraction of capacity compaction aims to leave occupied
pub const DEFAULT_TARGET_USAGE: f32 = 0.6;

/// Engine-side store of positions for the active sequence
pub trait KvCache {
    /// Inclusive `(min, max)` occupied positions, `None` when empty
    fn occupied_range(&self) -> Option<(Position, Position)>;

    /// Removes state in `[start, end)`; `end = None` means to the end.
    /// Returns false if the engine refuses the edit.
    fn remove_range(&mut self, start: Position, end: Option<Position>) -> bool;

    /// Moves state in `[start, end)` by `delta` positions
    fn shift_range(&mut self, start: Position, end: Option<Position>, delta: i32);

    /// Configured context capacity in positions
    fn capacity(&self) -> u32;

    /// One past the highest occupied position, 0 when empty
    fn current_position(&self) -> Position {
        self.occupied_range().map_or(0, |(_, max)| max + 1)
    }

    /// Number of positions between min and max inclusive
    fn occupied_span(&self) -> u32 {
        self.occupied_range().map_or(0, |(min, max)| max - min + 1)
    }
}

/// Removes a middle window of old state and closes the gap.
///
/// Runs only when the occupied span exceeds [`COMPACTION_THRESHOLD`] of
/// capacity. Keeps `keep_head` positions after the minimum and `keep_tail`
/// positions up to the maximum. Returns the removed window, in positions as
/// they were before the shift.
pub fn compact_window<K: KvCache + ?Sized>(
    kv: &mut K,
    keep_head: u32,
    keep_tail: u32,
    target_usage: f32,
) -> Option<Range<Position>> {
    let (min, max) = kv.occupied_range()?;
    let capacity = kv.capacity();
    let span = max - min + 1;
    if span as f32 <= capacity as f32 * COMPACTION_THRESHOLD {
        return None;
    }

    let start = min.saturating_add(keep_head);
    let end = (max + 1).saturating_sub(keep_tail);
    if start >= end {
        tracing::debug!(
            "Nothing to compact: window [{start}, {end}) is empty (span {span}, capacity {capacity})"
        );
        return None;
    }

    if !kv.remove_range(start, Some(end)) {
        tracing::warn!("Engine refused removal of [{start}, {end}) during compaction");
        return None;
    }
    let width = end - start;
    kv.shift_range(end, None, -(width as i32));

    let usage = kv.occupied_span() as f32 / capacity as f32;
    tracing::info!(
        "Compacted cache: dropped [{start}, {end}), usage {:.0}% (target {:.0}%)",
        usage * 100.0,
        target_usage * 100.0
    );
    if usage > target_usage {
        tracing::debug!("Compaction left usage above target; preserved head and tail dominate");
    }
    Some(start..end)
}

/// [`compact_window`] reporting only whether anything was removed
pub fn compact<K: KvCache + ?Sized>(
    kv: &mut K,
    keep_head: u32,
    keep_tail: u32,
    target_usage: f32,
) -> bool {
    compact_window(kv, keep_head, keep_tail, target_usage).is_some()
}

/// Tail length that leaves `target_usage` of capacity occupied after compaction
pub fn tail_for_target(capacity: u32, keep_head: u32, target_usage: f32) -> u32 {
    let retained = (capacity as f32 * target_usage) as u32;
    retained.saturating_sub(keep_head)
}

/// Positions that can always be decoded in one piece.
///
/// A piece no larger than this either fits below capacity or starts from a
/// span above [`COMPACTION_THRESHOLD`], where compaction is allowed to run.
pub fn decode_headroom(capacity: u32) -> u32 {
    let threshold = (capacity as f32 * COMPACTION_THRESHOLD) as u32;
    capacity.saturating_sub(threshold).max(1)
}

/// Size of each decode piece for a given batch size and capacity
pub fn piece_len(batch_size: usize, capacity: u32) -> usize {
    batch_size.min(decode_headroom(capacity) as usize).max(1)
}

/// Prepares the store for `incoming` new positions.
///
/// Compacts when the projected end crosses [`COMPACTION_THRESHOLD`], keeping
/// `keep_head` positions and a tail sized for `target_usage`. Fails if the
/// positions still do not fit. Returns the compacted window, if any.
pub fn make_room<K: KvCache + ?Sized>(
    kv: &mut K,
    incoming: u32,
    keep_head: u32,
    target_usage: f32,
) -> Result<Option<Range<Position>>> {
    let capacity = kv.capacity();
    let projected = kv.current_position() + incoming;
    let mut window = None;
    if projected as f32 > capacity as f32 * COMPACTION_THRESHOLD {
        let keep_tail = tail_for_target(capacity, keep_head, target_usage);
        window = compact_window(kv, keep_head, keep_tail, target_usage);
    }
    let projected = kv.current_position() + incoming;
    if projected > capacity {
        return Err(InferenceError::Decode(format!(
            "context full: {projected} positions needed, capacity {capacity}"
        )));
    }
    Ok(window)
}
