//! Test doubles shared by unit tests

use std::collections::BTreeSet;
use std::ops::Range;

use crate::cache::kv::{KvCache, Position};

/// A call made against [`MemoryKv`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCall {
    Remove(Position, Option<Position>),
    Shift(Position, Option<Position>, i32),
}

/// In-memory position store that records every mutation
#[derive(Debug, Default)]
pub struct MemoryKv {
    positions: BTreeSet<Position>,
    capacity: u32,
    refuse_removals: bool,
    calls: Vec<KvCall>,
}

impl MemoryKv {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn filled(capacity: u32, range: Range<Position>) -> Self {
        let mut kv = Self::new(capacity);
        kv.positions.extend(range);
        kv
    }

    /// Marks `[current, current + n)` occupied, as a decode would
    pub fn advance(&mut self, n: u32) {
        let start = self.current_position();
        self.positions.extend(start..start + n);
    }

    pub fn refuse_removals(&mut self, refuse: bool) {
        self.refuse_removals = refuse;
    }

    pub fn calls(&self) -> &[KvCall] {
        &self.calls
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }
}

impl KvCache for MemoryKv {
    fn occupied_range(&self) -> Option<(Position, Position)> {
        Some((*self.positions.first()?, *self.positions.last()?))
    }

    fn remove_range(&mut self, start: Position, end: Option<Position>) -> bool {
        self.calls.push(KvCall::Remove(start, end));
        if self.refuse_removals {
            return false;
        }
        let end = end.unwrap_or(Position::MAX);
        self.positions.retain(|p| *p < start || *p >= end);
        true
    }

    fn shift_range(&mut self, start: Position, end: Option<Position>, delta: i32) {
        self.calls.push(KvCall::Shift(start, end, delta));
        let end = end.unwrap_or(Position::MAX);
        self.positions = self
            .positions
            .iter()
            .filter_map(|&p| {
                if p >= start && p < end {
                    let moved = p as i64 + delta as i64;
                    (moved >= 0).then_some(moved as Position)
                } else {
                    Some(p)
                }
            })
            .collect();
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}
