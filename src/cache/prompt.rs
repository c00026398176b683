//! Chunk-level prompt cache
//!
//! Remembers which conversation chunks the engine has already processed and
//! the position each one advanced the sequence to, so a new request only
//! submits the part that differs.

use crate::cache::kv::{KvCache, Position};
use crate::error::{InferenceError, Result};
use crate::types::MessageChunk;

/// A processed chunk and the position reached after it
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub chunk: MessageChunk,
    pub last_position: Position,
}

/// Outcome of comparing a request against the cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDiff {
    /// Index of the first chunk that is not fully cached
    pub index: usize,
    /// Text that extends the cached entry at `index`, when it is a strict prefix
    pub remainder: Option<MessageChunk>,
}

impl CacheDiff {
    /// Number of cached entries that stay valid
    pub fn reusable_entries(&self) -> usize {
        self.index + usize::from(self.remainder.is_some())
    }

    /// Chunks that still have to be evaluated for `request`
    pub fn pending(&self, request: &[MessageChunk]) -> Vec<MessageChunk> {
        match &self.remainder {
            Some(rest) => std::iter::once(rest.clone())
                .chain(request.iter().skip(self.index + 1).cloned())
                .collect(),
            None => request.iter().skip(self.index).cloned().collect(),
        }
    }
}

/// Ordered history of processed chunks for one conversation
#[derive(Debug, Default, Clone)]
pub struct PromptCache {
    entries: Vec<CacheEntry>,
}

impl PromptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Position reached by the newest entry, 0 when empty
    pub fn last_position(&self) -> Position {
        self.entries.last().map_or(0, |e| e.last_position)
    }

    /// Records a processed chunk.
    ///
    /// Consecutive chunks of the same kind are one continuous run for the
    /// engine, so they are merged into the newest entry.
    pub fn record_append(&mut self, mut chunk: MessageChunk, position: Position) {
        debug_assert!(
            position >= self.last_position(),
            "cache positions must not decrease"
        );
        if let Some(last) = self.entries.last_mut() {
            match last.chunk.try_merge(chunk) {
                Ok(()) => {
                    last.last_position = position;
                    return;
                }
                Err(other) => chunk = other,
            }
        }
        self.entries.push(CacheEntry {
            chunk,
            last_position: position,
        });
    }

    /// Finds the longest cached prefix of `request`.
    ///
    /// Text matches while the cached text is a prefix of the new text; a
    /// strictly longer new text is a partial hit and ends the scan. Image and
    /// video sets only match on exact equality.
    pub fn diff(&self, request: &[MessageChunk]) -> CacheDiff {
        for (index, (new, entry)) in request.iter().zip(&self.entries).enumerate() {
            match (new, &entry.chunk) {
                (MessageChunk::Text(new), MessageChunk::Text(cached)) => {
                    if new == cached {
                        continue;
                    }
                    if let Some(rest) = new.strip_prefix(cached.as_str()) {
                        return CacheDiff {
                            index,
                            remainder: Some(MessageChunk::Text(rest.to_string())),
                        };
                    }
                    return CacheDiff {
                        index,
                        remainder: None,
                    };
                }
                (MessageChunk::Images(new), MessageChunk::Images(cached))
                | (MessageChunk::Videos(new), MessageChunk::Videos(cached)) => {
                    if new != cached {
                        return CacheDiff {
                            index,
                            remainder: None,
                        };
                    }
                }
                (MessageChunk::Text(_), _)
                | (MessageChunk::Images(_), _)
                | (MessageChunk::Videos(_), _) => {
                    return CacheDiff {
                        index,
                        remainder: None,
                    };
                }
            }
        }
        CacheDiff {
            index: request.len().min(self.entries.len()),
            remainder: None,
        }
    }

    /// Drops every entry past the reusable prefix and removes the matching
    /// engine state. Returns the position new content will start from.
    ///
    /// A refused removal means the engine holds state no entry accounts for;
    /// that is reported as [`InferenceError::InvariantViolation`].
    pub fn invalidate_from<K: KvCache + ?Sized>(
        &mut self,
        kv: &mut K,
        diff: &CacheDiff,
    ) -> Result<Position> {
        let keep = diff.reusable_entries().min(self.entries.len());
        // Removal starts at the end of the last kept entry, not at the end of
        // the diverged one (see "Divergence removal start" in DESIGN.md).
        let start = match keep {
            0 => 0,
            n => self.entries[n - 1].last_position,
        };
        let current = kv.current_position();
        if start < current {
            tracing::debug!("Removing stale cache range [{start}, {current})");
            if !kv.remove_range(start, Some(current)) {
                return Err(InferenceError::InvariantViolation(format!(
                    "engine refused removal of [{start}, {current}) while truncating prompt cache to {keep} entries"
                )));
            }
        }
        self.entries.truncate(keep);
        Ok(start)
    }

    /// Diffs `request`, invalidates whatever diverged and returns the chunks
    /// left to evaluate.
    ///
    /// Empty text is skipped. An identical (or shorter) request would leave
    /// nothing to evaluate and no fresh logits to sample from, so its last
    /// non-empty chunk is re-evaluated.
    pub fn prepare<K: KvCache + ?Sized>(
        &mut self,
        kv: &mut K,
        request: &[MessageChunk],
    ) -> Result<Vec<MessageChunk>> {
        let mut diff = self.diff(request);
        let mut pending = without_empty_text(diff.pending(request));
        if pending.is_empty() {
            if let Some(last) = request.iter().rposition(|c| !c.is_empty_text()) {
                diff = CacheDiff {
                    index: last,
                    remainder: None,
                };
                pending = without_empty_text(diff.pending(request));
            }
        }
        tracing::debug!(
            "Prompt cache reuses {} of {} entries, {} chunk(s) pending",
            diff.reusable_entries().min(self.entries.len()),
            self.entries.len(),
            pending.len()
        );
        self.invalidate_from(kv, &diff)?;
        Ok(pending)
    }

    /// Keeps only entries whose state ends at or before `position`.
    ///
    /// Used after compaction, when later entries no longer describe an
    /// unbroken prefix of the sequence.
    pub fn retain_through(&mut self, position: Position) {
        let keep = self
            .entries
            .iter()
            .take_while(|e| e.last_position <= position)
            .count();
        self.entries.truncate(keep);
    }
}

fn without_empty_text(mut chunks: Vec<MessageChunk>) -> Vec<MessageChunk> {
    chunks.retain(|c| !c.is_empty_text());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::kv::{make_room, DEFAULT_TARGET_USAGE};
    use crate::testing::{KvCall, MemoryKv};
    use crate::types::Attachment;

    fn text(s: &str) -> MessageChunk {
        MessageChunk::text(s)
    }

    fn images(ids: &[&str]) -> MessageChunk {
        MessageChunk::Images(ids.iter().map(|id| Attachment::new(*id, id.as_bytes())).collect())
    }

    fn cache_of(entries: &[(MessageChunk, Position)]) -> PromptCache {
        PromptCache {
            entries: entries
                .iter()
                .map(|(chunk, pos)| CacheEntry {
                    chunk: chunk.clone(),
                    last_position: *pos,
                })
                .collect(),
        }
    }

    #[test]
    fn test_merge_on_append() {
        let mut cache = PromptCache::new();
        cache.record_append(text("a"), 3);
        cache.record_append(text("b"), 5);
        assert_eq!(cache.entries(), &[CacheEntry { chunk: text("ab"), last_position: 5 }]);
    }

    #[test]
    fn test_append_different_kind_adds_entry() {
        let mut cache = PromptCache::new();
        cache.record_append(text("a"), 3);
        cache.record_append(images(&["x"]), 9);
        cache.record_append(text("b"), 12);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.last_position(), 12);
    }

    #[test]
    fn test_prefix_extension_is_partial_hit() {
        let mut cache = cache_of(&[(text("ab"), 2)]);
        let mut kv = MemoryKv::filled(64, 0..2);
        let request = [text("abcd")];

        let diff = cache.diff(&request);
        assert_eq!(diff, CacheDiff { index: 0, remainder: Some(text("cd")) });

        let start = cache.invalidate_from(&mut kv, &diff).unwrap();
        assert_eq!(start, 2);
        assert!(kv.calls().is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(diff.pending(&request), vec![text("cd")]);

        kv.advance(2);
        cache.record_append(text("cd"), kv.current_position());
        assert_eq!(cache.entries(), &[CacheEntry { chunk: text("abcd"), last_position: 4 }]);
    }

    #[test]
    fn test_partial_hit_after_generation_removes_generated_tail() {
        let mut cache = cache_of(&[(text("ab"), 2)]);
        let mut kv = MemoryKv::filled(64, 0..5);

        let pending = cache.prepare(&mut kv, &[text("abXYZ")]).unwrap();
        assert_eq!(pending, vec![text("XYZ")]);
        assert_eq!(kv.calls(), &[KvCall::Remove(2, Some(5))]);
        assert_eq!(kv.occupied_range(), Some((0, 1)));
    }

    #[test]
    fn test_divergence_triggers_removal() {
        let mut cache = cache_of(&[(text("ab"), 2)]);
        let mut kv = MemoryKv::filled(64, 0..5);
        let request = [text("ac")];

        let diff = cache.diff(&request);
        assert_eq!(diff, CacheDiff { index: 0, remainder: None });

        cache.invalidate_from(&mut kv, &diff).unwrap();
        assert_eq!(kv.calls(), &[KvCall::Remove(0, Some(5))]);
        assert!(cache.is_empty());
        assert_eq!(kv.current_position(), 0);
        assert_eq!(diff.pending(&request), vec![text("ac")]);
    }

    #[test]
    fn test_divergence_keeps_earlier_entries() {
        let mut cache = cache_of(&[(text("sys"), 10), (images(&["a"]), 20), (text("q1"), 25)]);
        let mut kv = MemoryKv::filled(64, 0..30);

        let pending = cache
            .prepare(&mut kv, &[text("sys"), images(&["a"]), text("q2")])
            .unwrap();
        assert_eq!(pending, vec![text("q2")]);
        assert_eq!(kv.calls(), &[KvCall::Remove(20, Some(30))]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.last_position(), 20);
    }

    #[test]
    fn test_diff_is_idempotent() {
        let cache = cache_of(&[(text("hello"), 5), (images(&["a"]), 9)]);
        let request = [text("hello"), images(&["a"]), text("more")];
        assert_eq!(cache.diff(&request), cache.diff(&request));
        assert_eq!(cache.diff(&request), CacheDiff { index: 2, remainder: None });
    }

    #[test]
    fn test_image_superset_is_not_a_hit() {
        let cache = cache_of(&[(text("t"), 1), (images(&["a"]), 5)]);
        let diff = cache.diff(&[text("t"), images(&["a", "b"])]);
        assert_eq!(diff, CacheDiff { index: 1, remainder: None });
    }

    #[test]
    fn test_reordered_images_are_not_a_hit() {
        let cache = cache_of(&[(images(&["a", "b"]), 5)]);
        let diff = cache.diff(&[images(&["b", "a"])]);
        assert_eq!(diff, CacheDiff { index: 0, remainder: None });
    }

    #[test]
    fn test_video_matching_is_exact() {
        let video = MessageChunk::Videos(vec![Attachment::new("v", [1u8, 2])]);
        let cache = cache_of(&[(video.clone(), 40)]);
        assert_eq!(cache.diff(&[video]), CacheDiff { index: 1, remainder: None });
        let other = MessageChunk::Videos(vec![Attachment::new("v", [1u8, 3])]);
        assert_eq!(cache.diff(&[other]), CacheDiff { index: 0, remainder: None });
    }

    #[test]
    fn test_kind_mismatch_diverges() {
        let cache = cache_of(&[(text("a"), 1)]);
        assert_eq!(
            cache.diff(&[images(&["a"])]),
            CacheDiff { index: 0, remainder: None }
        );
    }

    #[test]
    fn test_identical_request_reevaluates_last_chunk() {
        let mut cache = cache_of(&[(text("sys"), 10), (images(&["q"]), 14)]);
        let mut kv = MemoryKv::filled(64, 0..20);

        let pending = cache.prepare(&mut kv, &[text("sys"), images(&["q"])]).unwrap();
        assert_eq!(pending, vec![images(&["q"])]);
        assert_eq!(kv.calls(), &[KvCall::Remove(10, Some(20))]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shorter_request_truncates_cache() {
        let mut cache = cache_of(&[(text("a"), 2), (images(&["x"]), 6), (text("b"), 8)]);
        let mut kv = MemoryKv::filled(64, 0..8);

        let pending = cache.prepare(&mut kv, &[text("a")]).unwrap();
        assert_eq!(pending, vec![text("a")]);
        assert!(cache.is_empty());
        assert_eq!(kv.calls(), &[KvCall::Remove(0, Some(8))]);
    }

    #[test]
    fn test_refused_removal_is_invariant_violation() {
        let mut cache = cache_of(&[(text("ab"), 2)]);
        let mut kv = MemoryKv::filled(64, 0..5);
        kv.refuse_removals(true);

        let err = cache.prepare(&mut kv, &[text("zz")]).unwrap_err();
        assert!(matches!(err, InferenceError::InvariantViolation(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_retain_through_drops_shifted_entries() {
        let mut cache = cache_of(&[(text("a"), 50), (images(&["x"]), 120), (text("b"), 900)]);
        cache.retain_through(100);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.last_position(), 50);
    }

    #[test]
    fn test_trailing_empty_text_reevaluates_last_content() {
        let mut cache = cache_of(&[(text("a"), 3)]);
        let mut kv = MemoryKv::filled(64, 0..6);

        let pending = cache.prepare(&mut kv, &[text("a"), text("")]).unwrap();
        assert_eq!(pending, vec![text("a")]);
        assert_eq!(kv.calls(), &[KvCall::Remove(0, Some(6))]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_text_is_never_pending() {
        let mut cache = PromptCache::new();
        let mut kv = MemoryKv::new(64);
        let pending = cache.prepare(&mut kv, &[text(""), text("hi"), text("")]).unwrap();
        assert_eq!(pending, vec![text("hi")]);
    }

    #[test]
    fn test_cache_tracks_engine_across_compaction() {
        let mut cache = PromptCache::new();
        let mut kv = MemoryKv::new(100);
        let keep_head = 10;

        // Chunk sizes in positions
        let first = [(text("sys"), 10), (images(&["a"]), 30), (text("q1"), 20)];
        let request: Vec<_> = first.iter().map(|(c, _)| c.clone()).collect();
        assert_eq!(cache.prepare(&mut kv, &request).unwrap(), request);
        for (chunk, len) in first {
            assert_eq!(make_room(&mut kv, len, keep_head, DEFAULT_TARGET_USAGE), Ok(None));
            kv.advance(len);
            cache.record_append(chunk, kv.current_position());
        }
        assert_eq!(cache.last_position(), 60);

        // Generated tokens push the span over the threshold
        let mut window = None;
        for _ in 0..30 {
            if let Some(w) = make_room(&mut kv, 1, keep_head, DEFAULT_TARGET_USAGE).unwrap() {
                cache.retain_through(w.start);
                window = Some(w);
            }
            kv.advance(1);
        }
        assert_eq!(window, Some(10..32));
        assert_eq!(kv.current_position(), 69);
        assert_eq!(cache.entries(), &[CacheEntry { chunk: text("sys"), last_position: 10 }]);

        let mut next = request.clone();
        next.push(text("q2"));
        let pending = cache.prepare(&mut kv, &next).unwrap();
        assert_eq!(pending, next[1..].to_vec());
        assert_eq!(kv.calls().last(), Some(&KvCall::Remove(10, Some(69))));
        assert_eq!(kv.current_position(), cache.last_position());
    }
}
