//! End-to-end scenarios for buffer switching, reuse, holds and compaction

use photondb_datastore::datastore::{BufferStatus, FreeListAllocator, GrowthPolicy};
use photondb_datastore::{
    BufferType, CompactionSpec, CompactionStrategy, DataStore, DataStoreBase, EntryRef, GenerationHandler,
    RefLayout,
};
use std::sync::Arc;

fn base_with<T>(policy: GrowthPolicy, array_size: usize) -> (DataStoreBase, u32)
where
    T: Clone + Default + Send + Sync + 'static,
{
    let mut base = DataStoreBase::new(RefLayout::new(20).expect("layout"), 256, 1 << 20).expect("store");
    let type_id = base.add_type(Arc::new(BufferType::<T>::with_policy(array_size, policy)));
    base.init_primary_buffers();
    (base, type_id)
}

#[test]
fn test_full_primary_buffer_switches_on_next_request() {
    let (mut base, type_id) = base_with::<u64>(GrowthPolicy::new(1, 1 << 20), 1);
    assert_eq!(base.type_handler(type_id).elem_size(), 8);

    base.ensure_buffer_capacity(type_id, 1000);
    let primary = base.primary_buffer_id(type_id);
    assert!(base.buffer_stats(primary).remaining() >= 1000);

    for v in 0..1000u64 {
        base.push_values(type_id, [v]);
    }
    assert_eq!(base.primary_buffer_id(type_id), primary);
    assert_eq!(base.buffer_stats(primary).remaining(), 0);

    base.ensure_buffer_capacity(type_id, 1);
    assert_ne!(base.primary_buffer_id(type_id), primary);
    assert_eq!(base.buffer_status(primary), BufferStatus::Active);
}

#[test]
fn test_freed_entry_is_reused_before_cursor_advances() {
    let (mut base, type_id) = base_with::<u32>(GrowthPolicy::new(16, 1 << 20), 1);
    base.enable_free_lists();

    let refs: Vec<EntryRef> = {
        let mut allocator = FreeListAllocator::<u32>::new(&mut base, type_id);
        (1..=3).map(|v| allocator.alloc(v).entry_ref).collect()
    };
    let used_before = base.buffer_stats(0).used_elems;

    base.free_elem(refs[1], 1);
    let reused = FreeListAllocator::<u32>::new(&mut base, type_id).alloc(42).entry_ref;

    assert_eq!(reused, refs[1]);
    assert_eq!(base.buffer_stats(0).used_elems, used_before);
    assert_eq!(*base.get_entry::<u32>(refs[0]), 1);
    assert_eq!(*base.get_entry::<u32>(refs[1]), 42);
    assert_eq!(*base.get_entry::<u32>(refs[2]), 3);

    let next = FreeListAllocator::<u32>::new(&mut base, type_id).alloc(4).entry_ref;
    assert_eq!(base.layout().offset(next), base.layout().offset(refs[2]) + 1);
}

#[test]
fn test_held_buffer_freed_only_at_its_generation() {
    let (mut base, type_id) = base_with::<u64>(GrowthPolicy::new(16, 1 << 20), 1);
    let r = base.push_values(type_id, [5u64]);
    let buffer_id = base.layout().buffer_id(r);

    base.hold_buffer(buffer_id);
    let g1 = 7;
    base.assign_generation(g1);

    base.reclaim_memory(g1 - 1);
    assert_eq!(base.buffer_status(buffer_id), BufferStatus::Hold);
    assert!(base.mem_stats().hold_buffers == 1);

    base.reclaim_memory(g1);
    assert_eq!(base.buffer_status(buffer_id), BufferStatus::Free);
    assert!(!base.has_held_buffers());

    // The freed buffer is picked again by the next switch
    let primary = base.primary_buffer_id(type_id);
    base.hold_buffer(primary);
    assert_eq!(base.primary_buffer_id(type_id), buffer_id);
}

#[test]
fn test_compaction_preserves_live_values() {
    let mut store = DataStore::<String>::with_min_arrays(64);
    store.base_mut().disable_free_lists();
    let generations = GenerationHandler::new();

    let mut live: Vec<(EntryRef, String)> = Vec::new();
    for i in 0..1000 {
        let value = format!("value-{}", i);
        let r = store.add_entry(value.clone());
        if i % 4 == 0 {
            live.push((r, value));
        } else {
            store.hold_entry(r);
        }
    }
    store.commit(&generations);
    let old_refs: Vec<EntryRef> = live.iter().map(|(r, _)| *r).collect();

    let strategy = CompactionStrategy::default()
        .with_max_buffers(16)
        .with_active_buffers_ratio(1.0)
        .with_slack(0, 0);
    let compacting = store.start_compact(CompactionSpec::new(true, true), &strategy);
    let compacted = compacting.buffer_ids().to_vec();
    assert!(!compacted.is_empty());
    for (r, _) in live.iter_mut() {
        if compacting.has(*r) {
            *r = store.move_on_compact(*r);
        }
    }
    store.finish_compact(compacting);

    for (r, value) in &live {
        assert!(!compacted.contains(&store.base().layout().buffer_id(*r)));
        assert_eq!(store.get_entry(*r), value);
    }

    store.commit(&generations);
    for buffer_id in &compacted {
        assert_eq!(store.base().buffer_status(*buffer_id), BufferStatus::Free);
    }
    let invalidated = old_refs
        .iter()
        .filter(|r| compacted.contains(&store.base().layout().buffer_id(**r)))
        .count();
    assert!(invalidated > 0);
}

#[test]
fn test_compaction_respects_reader_guard() {
    let mut store = DataStore::<u64>::with_min_arrays(32);
    store.base_mut().disable_free_lists();
    let generations = GenerationHandler::new();
    let mut refs: Vec<EntryRef> = (0..200u64).map(|v| store.add_entry(v)).collect();
    for r in refs.drain(..150) {
        store.hold_entry(r);
    }
    store.commit(&generations);

    let reader = store.reader();
    let guard = generations.take_guard();
    let before = refs[0];

    let strategy = CompactionStrategy::default()
        .with_max_buffers(8)
        .with_active_buffers_ratio(1.0)
        .with_slack(0, 0);
    let moved = store.compact_worst(CompactionSpec::new(true, false), &strategy, &mut refs);
    assert!(moved > 0);
    store.commit(&generations);

    // The guard keeps the compacted buffer alive
    assert!(store.base().has_held_buffers());
    assert_eq!(unsafe { *reader.get_entry::<u64>(&guard, before) }, 150);

    drop(guard);
    store.commit(&generations);
    assert!(!store.base().has_held_buffers());
    for (i, r) in refs.iter().enumerate() {
        assert_eq!(*store.get_entry(*r), 150 + i as u64);
    }
}

#[test]
fn test_grow_in_place_policy() {
    let policy = GrowthPolicy::new(4, 1 << 20).with_num_arrays_for_new_buffer(1 << 12);
    let (mut base, type_id) = base_with::<u64>(policy, 1);
    let refs: Vec<EntryRef> = (0..2000u64).map(|v| base.push_values(type_id, [v])).collect();

    assert_eq!(base.bufferid_limit(), 1);
    assert!(base.mem_stats().hold_bytes > 0);
    base.reclaim_all_memory();
    assert_eq!(base.mem_stats().hold_bytes, 0);
    for (v, r) in refs.iter().enumerate() {
        assert_eq!(*base.get_entry::<u64>(*r), v as u64);
    }
}

#[test]
fn test_address_space_accounting() {
    let (mut base, type_id) = base_with::<u32>(GrowthPolicy::new(8, 1 << 20), 4);
    let r = base.push_values(type_id, vec![1u32, 2, 3, 4]);
    base.push_values(type_id, vec![5u32, 6, 7, 8]);

    let space = base.address_space_usage();
    // Reserved array plus two arrays in use
    assert_eq!(space.used(), 3);
    assert_eq!(space.dead(), 1);

    base.hold_elem(r, 4);
    base.assign_generation(1);
    base.reclaim_memory(1);
    let space = base.address_space_usage();
    assert_eq!(space.used(), 3);
    assert_eq!(space.dead(), 2);
    assert_eq!(base.get_entry_array::<u32>(r, 4), &[0, 0, 0, 0]);
}
