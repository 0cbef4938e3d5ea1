//! Allocation front-ends for a single type

use super::base::DataStoreBase;
use super::entry_ref::EntryRef;
use std::marker::PhantomData;

/// A freshly allocated entry
#[derive(Debug)]
pub struct Handle<'a, T> {
    pub entry_ref: EntryRef,
    pub data: &'a mut T,
}

/// Appends entries to the primary buffer of one type
pub struct Allocator<'a, T> {
    store: &'a mut DataStoreBase,
    type_id: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: 'static> Allocator<'a, T> {
    pub fn new(store: &'a mut DataStoreBase, type_id: u32) -> Self {
        Self {
            store,
            type_id,
            _marker: PhantomData,
        }
    }

    pub fn alloc(&mut self, value: T) -> Handle<'_, T> {
        let entry_ref = self.store.push_values(self.type_id, std::iter::once(value));
        Handle {
            entry_ref,
            data: self.store.get_entry_mut(entry_ref),
        }
    }

    pub fn alloc_array(&mut self, values: &[T]) -> EntryRef
    where
        T: Clone,
    {
        self.store.push_values(self.type_id, values.iter().cloned())
    }
}

/// Reuses reclaimed entries before appending new ones
///
/// Only whole arrays are reused, so `alloc_array` must be given exactly one
/// array of the type's array size to be served from the free list.
pub struct FreeListAllocator<'a, T> {
    store: &'a mut DataStoreBase,
    type_id: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: 'static> FreeListAllocator<'a, T> {
    pub fn new(store: &'a mut DataStoreBase, type_id: u32) -> Self {
        Self {
            store,
            type_id,
            _marker: PhantomData,
        }
    }

    pub fn alloc(&mut self, value: T) -> Handle<'_, T> {
        let array_size = self.store.type_handler(self.type_id).array_size();
        let entry_ref = match self.pop_if(array_size == 1) {
            Some(entry_ref) => {
                *self.store.get_entry_mut::<T>(entry_ref) = value;
                entry_ref
            }
            None => self.store.push_values(self.type_id, std::iter::once(value)),
        };
        Handle {
            entry_ref,
            data: self.store.get_entry_mut(entry_ref),
        }
    }

    pub fn alloc_array(&mut self, values: &[T]) -> EntryRef
    where
        T: Clone,
    {
        let array_size = self.store.type_handler(self.type_id).array_size();
        match self.pop_if(values.len() == array_size) {
            Some(entry_ref) => {
                self.store
                    .get_entry_array_mut::<T>(entry_ref, array_size)
                    .clone_from_slice(values);
                entry_ref
            }
            None => self.store.push_values(self.type_id, values.iter().cloned()),
        }
    }

    fn pop_if(&mut self, reusable: bool) -> Option<EntryRef> {
        if reusable {
            self.store.pop_free_entry(self.type_id)
        } else {
            None
        }
    }
}
