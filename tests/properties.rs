//! Property tests for allocation, reuse, generations, compaction and growth

use photondb_datastore::datastore::{BufferStatus, GrowthPolicy};
use photondb_datastore::{
    BufferType, CompactionSpec, CompactionStrategy, DataStore, DataStoreBase, EntryRef, RefLayout,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn base_with(policy: GrowthPolicy, array_size: usize) -> (DataStoreBase, u32) {
    let mut base = DataStoreBase::new(RefLayout::new(20).unwrap(), 512, 1 << 20).unwrap();
    let type_id = base.add_type(Arc::new(BufferType::<u64>::with_policy(array_size, policy)));
    base.init_primary_buffers();
    (base, type_id)
}

fn arb_policy() -> impl Strategy<Value = GrowthPolicy> {
    (1usize..64, prop_oneof![Just(0usize), 1usize..256], 0.0f64..1.0).prop_map(
        |(min_arrays, for_new_buffer, grow_factor)| {
            GrowthPolicy::new(min_arrays, 1 << 16)
                .with_num_arrays_for_new_buffer(for_new_buffer)
                .with_grow_factor(grow_factor)
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every allocation gets its own ref, which reads back the last value written there.
    #[test]
    fn prop_refs_unique_and_hold_last_write(
        values in prop::collection::vec(any::<u64>(), 1..400),
        writes in prop::collection::vec((any::<prop::sample::Index>(), any::<u64>()), 0..100),
        policy in arb_policy(),
    ) {
        let (mut base, type_id) = base_with(policy, 1);
        let refs: Vec<EntryRef> = values.iter().map(|&v| base.push_values(type_id, [v])).collect();
        let mut model = values.clone();

        let unique: HashSet<EntryRef> = refs.iter().copied().collect();
        prop_assert_eq!(unique.len(), refs.len());
        prop_assert!(!unique.contains(&EntryRef::INVALID));

        for (index, value) in writes {
            let i = index.index(refs.len());
            *base.get_entry_mut::<u64>(refs[i]) = value;
            model[i] = value;
        }
        for (r, expected) in refs.iter().zip(&model) {
            prop_assert_eq!(base.get_entry::<u64>(*r), expected);
        }
    }

    /// Freeing an entry and popping it again restores the dead count.
    #[test]
    fn prop_free_list_round_trip(count in 2usize..100, pick in any::<prop::sample::Index>()) {
        let (mut base, type_id) = base_with(GrowthPolicy::new(16, 1 << 16), 1);
        base.enable_free_lists();
        let refs: Vec<EntryRef> = (0..count as u64).map(|v| base.push_values(type_id, [v])).collect();
        let r = refs[pick.index(count)];
        let buffer_id = base.layout().buffer_id(r);
        let dead_before = base.buffer_stats(buffer_id).dead_elems;

        base.free_elem(r, 1);
        prop_assert_eq!(base.buffer_stats(buffer_id).dead_elems, dead_before + 1);
        prop_assert_eq!(base.pop_free_entry(type_id), Some(r));
        prop_assert_eq!(base.buffer_stats(buffer_id).dead_elems, dead_before);
        prop_assert_eq!(base.pop_free_entry(type_id), None);
    }

    /// Memory retired at generation g is only reclaimed once the oldest used generation reaches g.
    #[test]
    fn prop_reclaim_waits_for_generation(g in 1u64..1000, oldest in 0u64..1000) {
        let (mut base, type_id) = base_with(GrowthPolicy::new(8, 1 << 16), 1);
        base.enable_free_lists();
        let r = base.push_values(type_id, [1u64]);
        let buffer_id = base.primary_buffer_id(type_id);
        base.hold_elem(r, 1);
        base.hold_buffer(buffer_id);
        base.assign_generation(g);

        base.reclaim_memory(oldest);
        let status = base.buffer_status(buffer_id);
        if oldest >= g {
            prop_assert_eq!(status, BufferStatus::Free);
            prop_assert_eq!(base.mem_stats().hold_elems, 0);
            // The freed buffer is taken by the next switch
            let primary = base.primary_buffer_id(type_id);
            base.hold_buffer(primary);
            prop_assert_eq!(base.primary_buffer_id(type_id), buffer_id);
        } else {
            prop_assert_eq!(status, BufferStatus::Hold);
            prop_assert!(base.has_held_buffers());
        }
    }

    /// Relocating the live entries of compacted buffers keeps their values.
    #[test]
    fn prop_compaction_preserves_values(
        keep in prop::collection::vec(any::<bool>(), 50..600),
        max_buffers in 1u32..8,
    ) {
        let mut store = DataStore::<u64>::with_min_arrays(32);
        store.base_mut().disable_free_lists();
        let mut live = Vec::new();
        for (v, &kept) in keep.iter().enumerate() {
            let r = store.add_entry(v as u64);
            if kept {
                live.push((r, v as u64));
            } else {
                store.hold_entry(r);
            }
        }
        store.reclaim_all_memory();

        let strategy = CompactionStrategy::default()
            .with_max_buffers(max_buffers)
            .with_active_buffers_ratio(1.0)
            .with_slack(0, 0);
        let mut refs: Vec<EntryRef> = live.iter().map(|(r, _)| *r).collect();
        let limit_before = store.base().bufferid_limit();
        let compacting = store.start_compact(CompactionSpec::new(true, true), &strategy);
        let compacted = compacting.buffer_ids().to_vec();
        prop_assert!(compacted.len() <= 2 * max_buffers as usize);
        prop_assert!(compacted.iter().all(|&id| id < limit_before));
        for r in refs.iter_mut() {
            if compacting.has(*r) {
                *r = store.move_on_compact(*r);
            }
        }
        store.finish_compact(compacting);
        store.reclaim_all_memory();

        for (r, (_, value)) in refs.iter().zip(&live) {
            prop_assert!(!compacted.contains(&store.base().layout().buffer_id(*r)));
            prop_assert_eq!(store.get_entry(*r), value);
        }
        for id in compacted {
            prop_assert_eq!(store.base().buffer_status(id), BufferStatus::Free);
        }
    }

    /// After ensure_buffer_capacity(t, n) the primary buffer has room for n elements.
    #[test]
    fn prop_ensure_capacity_leaves_room(
        requests in prop::collection::vec((1usize..300, 0usize..300), 1..40),
        policy in arb_policy(),
    ) {
        let (mut base, type_id) = base_with(policy, 1);
        for (needed, fill) in requests {
            base.ensure_buffer_capacity(type_id, needed);
            let primary = base.primary_buffer_id(type_id);
            prop_assert!(base.buffer_stats(primary).remaining() >= needed);
            for v in 0..fill.min(needed) as u64 {
                base.push_values(type_id, [v]);
            }
        }
    }
}
