//! Compaction planning
//!
//! Compaction moves live entries out of sparse buffers so the buffers can be
//! released. The store selects the worst buffers and marks them compacting,
//! the caller relocates every live ref the plan matches, and
//! `finish_compact` hands the emptied buffers to the generation holder.

use super::entry_ref::{EntryRef, RefLayout};
use super::memory_stats::{AddressSpace, MemoryUsage};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which resources a compaction pass should target
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionSpec {
    compact_memory: bool,
    compact_address_space: bool,
}

impl CompactionSpec {
    pub fn new(compact_memory: bool, compact_address_space: bool) -> Self {
        Self {
            compact_memory,
            compact_address_space,
        }
    }

    pub fn compact_memory(&self) -> bool {
        self.compact_memory
    }

    pub fn compact_address_space(&self) -> bool {
        self.compact_address_space
    }

    pub fn compact(&self) -> bool {
        self.compact_memory || self.compact_address_space
    }
}

/// Thresholds deciding when and how much to compact
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionStrategy {
    /// Dead bytes tolerated relative to used bytes
    pub max_dead_bytes_ratio: f64,
    /// Dead arrays tolerated relative to used arrays
    pub max_dead_address_space_ratio: f64,
    /// Upper bound on buffers compacted per pass, per resource
    pub max_buffers: u32,
    /// Upper bound on buffers compacted per pass relative to active buffers
    pub active_buffers_ratio: f64,
    pub dead_bytes_slack: usize,
    pub dead_address_space_slack: usize,
}

impl CompactionStrategy {
    pub const DEAD_BYTES_SLACK: usize = 0x10000;
    pub const DEAD_ADDRESS_SPACE_SLACK: usize = 0x10000;

    pub fn new(max_dead_bytes_ratio: f64, max_dead_address_space_ratio: f64) -> Self {
        Self {
            max_dead_bytes_ratio,
            max_dead_address_space_ratio,
            ..Self::default()
        }
    }

    pub fn with_max_buffers(mut self, max_buffers: u32) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    pub fn with_active_buffers_ratio(mut self, ratio: f64) -> Self {
        self.active_buffers_ratio = ratio;
        self
    }

    pub fn with_slack(mut self, dead_bytes_slack: usize, dead_address_space_slack: usize) -> Self {
        self.dead_bytes_slack = dead_bytes_slack;
        self.dead_address_space_slack = dead_address_space_slack;
        self
    }

    pub fn should_compact_memory(&self, usage: &MemoryUsage) -> bool {
        let dead = usage.dead_bytes;
        dead > self.dead_bytes_slack && dead as f64 > usage.used_bytes as f64 * self.max_dead_bytes_ratio
    }

    pub fn should_compact_address_space(&self, space: &AddressSpace) -> bool {
        let dead = space.dead();
        dead > self.dead_address_space_slack
            && dead as f64 > space.used() as f64 * self.max_dead_address_space_ratio
    }

    pub fn compaction_spec(&self, usage: &MemoryUsage, space: &AddressSpace) -> CompactionSpec {
        CompactionSpec::new(
            self.should_compact_memory(usage),
            self.should_compact_address_space(space),
        )
    }
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        Self {
            max_dead_bytes_ratio: 0.05,
            max_dead_address_space_ratio: 0.2,
            max_buffers: 1,
            active_buffers_ratio: 0.1,
            dead_bytes_slack: Self::DEAD_BYTES_SLACK,
            dead_address_space_slack: Self::DEAD_ADDRESS_SPACE_SLACK,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    buffer_id: u32,
    used: usize,
    dead: usize,
}

/// Candidate buffers for one resource, worst first
#[derive(Debug)]
pub struct CompactBufferCandidates {
    candidates: Vec<Candidate>,
    used: usize,
    dead: usize,
    max_buffers: u32,
    active_buffers_ratio: f64,
    ratio: f64,
    slack: usize,
    free_buffers: u32,
}

impl CompactBufferCandidates {
    pub fn new(
        num_buffers: u32,
        max_buffers: u32,
        active_buffers_ratio: f64,
        ratio: f64,
        slack: usize,
    ) -> Self {
        Self {
            candidates: Vec::with_capacity(num_buffers as usize),
            used: 0,
            dead: 0,
            max_buffers,
            active_buffers_ratio: active_buffers_ratio.clamp(0.0, 1.0),
            ratio,
            slack,
            free_buffers: 0,
        }
    }

    pub fn add(&mut self, buffer_id: u32, used: usize, dead: usize) {
        self.candidates.push(Candidate {
            buffer_id,
            used,
            dead,
        });
        self.used += used;
        self.dead += dead;
    }

    pub fn set_free_buffers(&mut self, free_buffers: u32) {
        self.free_buffers = free_buffers;
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Append the selected buffer ids to `buffers`
    ///
    /// Buffers are taken worst first while the dead amount left behind is
    /// still above both the slack and `ratio` of what is left in use.
    pub fn select(&mut self, buffers: &mut Vec<u32>) {
        if self.candidates.is_empty() || self.free_buffers == 0 {
            return;
        }
        let by_ratio = (self.candidates.len() as f64 * self.active_buffers_ratio).ceil() as u32;
        let limit = self
            .max_buffers
            .min(by_ratio)
            .max(1)
            .min(self.free_buffers) as usize;
        self.candidates
            .sort_by(|a, b| b.dead.cmp(&a.dead).then(a.buffer_id.cmp(&b.buffer_id)));

        let mut remaining_used = self.used;
        let mut remaining_dead = self.dead;
        for candidate in self.candidates.iter().take(limit) {
            if candidate.dead == 0
                || remaining_dead < self.slack
                || (remaining_dead as f64) < remaining_used as f64 * self.ratio
            {
                break;
            }
            buffers.push(candidate.buffer_id);
            remaining_used -= candidate.used;
            remaining_dead -= candidate.dead;
        }
    }
}

/// Bitset over buffer ids matching refs into compacting buffers
#[derive(Debug, Clone)]
pub struct EntryRefFilter {
    bits: Vec<u64>,
    layout: RefLayout,
}

impl EntryRefFilter {
    pub fn new(num_buffers: u32, layout: RefLayout) -> Self {
        Self {
            bits: vec![0; (num_buffers as usize).div_ceil(64)],
            layout,
        }
    }

    pub fn add_buffer(&mut self, buffer_id: u32) {
        let id = buffer_id as usize;
        self.bits[id / 64] |= 1 << (id % 64);
    }

    pub fn add_buffers(&mut self, buffer_ids: &[u32]) {
        for &buffer_id in buffer_ids {
            self.add_buffer(buffer_id);
        }
    }

    /// Whether `entry_ref` points into a filtered buffer; never true for the invalid ref
    #[inline]
    pub fn has(&self, entry_ref: EntryRef) -> bool {
        if !entry_ref.is_valid() {
            return false;
        }
        let id = self.layout.buffer_id(entry_ref) as usize;
        self.bits
            .get(id / 64)
            .is_some_and(|word| word & (1 << (id % 64)) != 0)
    }
}

/// Buffers selected by one compaction pass
///
/// Must be handed back to `finish_compact` once every matching ref has been
/// relocated.
#[must_use = "compacting buffers must be passed to finish_compact"]
#[derive(Debug)]
pub struct CompactingBuffers {
    buffer_ids: Vec<u32>,
    filter: EntryRefFilter,
    targets: Vec<(u32, u32)>,
    finished: bool,
}

impl CompactingBuffers {
    pub(crate) fn new(
        buffer_ids: Vec<u32>,
        bufferid_limit: u32,
        layout: RefLayout,
        targets: Vec<(u32, u32)>,
    ) -> Self {
        let mut filter = EntryRefFilter::new(bufferid_limit, layout);
        filter.add_buffers(&buffer_ids);
        Self {
            buffer_ids,
            filter,
            targets,
            finished: false,
        }
    }

    pub fn buffer_ids(&self) -> &[u32] {
        &self.buffer_ids
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_ids.is_empty()
    }

    pub fn filter(&self) -> &EntryRefFilter {
        &self.filter
    }

    pub fn has(&self, entry_ref: EntryRef) -> bool {
        self.filter.has(entry_ref)
    }

    /// `(type_id, buffer_id)` of the primary buffer each affected type
    /// relocates into, as of planning time
    pub fn targets(&self) -> &[(u32, u32)] {
        &self.targets
    }

    pub(crate) fn finish(&mut self) -> Vec<u32> {
        self.finished = true;
        std::mem::take(&mut self.buffer_ids)
    }
}

impl Drop for CompactingBuffers {
    fn drop(&mut self) {
        if !self.finished && !self.buffer_ids.is_empty() {
            warn!(
                buffers = ?self.buffer_ids,
                "compaction plan dropped without finish_compact; buffers stay compacting"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_defaults() {
        let strategy = CompactionStrategy::default();
        assert_eq!(strategy.max_dead_bytes_ratio, 0.05);
        assert_eq!(strategy.max_dead_address_space_ratio, 0.2);
        assert_eq!(strategy.max_buffers, 1);
        assert_eq!(strategy.active_buffers_ratio, 0.1);
        assert_eq!(strategy.dead_bytes_slack, 0x10000);
    }

    #[test]
    fn test_should_compact() {
        let strategy = CompactionStrategy::default();
        let mut usage = MemoryUsage {
            used_bytes: 1 << 20,
            dead_bytes: 0x8000,
            ..Default::default()
        };
        // Below slack
        assert!(!strategy.should_compact_memory(&usage));
        usage.dead_bytes = 0x20000;
        assert!(strategy.should_compact_memory(&usage));
        usage.used_bytes = 1 << 30;
        // Below ratio
        assert!(!strategy.should_compact_memory(&usage));

        let space = AddressSpace::new(1 << 20, 1 << 19, 1 << 22);
        assert!(strategy.should_compact_address_space(&space));
        let spec = strategy.compaction_spec(&usage, &space);
        assert!(!spec.compact_memory());
        assert!(spec.compact_address_space());
        assert!(spec.compact());
    }

    #[test]
    fn test_select_worst_first() {
        let mut candidates = CompactBufferCandidates::new(8, 2, 1.0, 0.1, 0);
        candidates.add(1, 100, 10);
        candidates.add(2, 100, 90);
        candidates.add(3, 100, 50);
        candidates.set_free_buffers(10);

        let mut selected = Vec::new();
        candidates.select(&mut selected);
        assert_eq!(selected, vec![2, 3]);
    }

    #[test]
    fn test_select_stops_when_remaining_dead_is_low() {
        let mut candidates = CompactBufferCandidates::new(8, 4, 1.0, 0.2, 0);
        candidates.add(1, 1000, 500);
        candidates.add(2, 1000, 10);
        candidates.set_free_buffers(10);

        let mut selected = Vec::new();
        candidates.select(&mut selected);
        // After buffer 1 only 10 of 1000 used bytes are dead
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn test_select_respects_slack_and_free_buffers() {
        let mut candidates = CompactBufferCandidates::new(8, 4, 1.0, 0.0, 1000);
        candidates.add(1, 1000, 500);
        candidates.set_free_buffers(10);
        let mut selected = Vec::new();
        candidates.select(&mut selected);
        assert!(selected.is_empty());

        let mut no_room = CompactBufferCandidates::new(8, 4, 1.0, 0.0, 0);
        no_room.add(1, 1000, 500);
        no_room.set_free_buffers(0);
        no_room.select(&mut selected);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_entry_ref_filter() {
        let layout = RefLayout::new(8).unwrap();
        let mut filter = EntryRefFilter::new(130, layout);
        filter.add_buffers(&[0, 65, 129]);

        assert!(filter.has(layout.make(65, 3)));
        assert!(filter.has(layout.make(129, 0)));
        assert!(filter.has(layout.make(0, 1)));
        assert!(!filter.has(layout.make(64, 1)));
        assert!(!filter.has(EntryRef::INVALID));
        // Out of range buffer ids never match
        assert!(!filter.has(layout.make(1000, 1)));
    }

    #[test]
    fn test_strategy_from_partial_toml() {
        let strategy: CompactionStrategy = toml::from_str("max_buffers = 4").unwrap();
        assert_eq!(strategy.max_buffers, 4);
        assert_eq!(strategy.max_dead_bytes_ratio, 0.05);
    }
}
