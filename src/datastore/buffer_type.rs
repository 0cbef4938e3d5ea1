//! Per-type buffer policy and element lifecycle hooks

use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// Default growth factor applied to live arrays when sizing a new buffer
pub const DEFAULT_ALLOC_GROW_FACTOR: f64 = 0.2;

/// Element counts aggregated over the active buffers of one type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferCounts {
    pub used_elems: usize,
    pub dead_elems: usize,
}

/// Sizing policy for the buffers of one type
///
/// `num_arrays_for_new_buffer` selects between growing the primary buffer in
/// place and switching to a fresh buffer: while the primary buffer holds fewer
/// arrays than that threshold it is resized, beyond it a new buffer is taken.
/// Zero means always switch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthPolicy {
    pub min_arrays: usize,
    pub max_arrays: usize,
    pub num_arrays_for_new_buffer: usize,
    pub alloc_grow_factor: f64,
}

impl GrowthPolicy {
    pub fn new(min_arrays: usize, max_arrays: usize) -> Self {
        Self {
            min_arrays,
            max_arrays,
            num_arrays_for_new_buffer: 0,
            alloc_grow_factor: DEFAULT_ALLOC_GROW_FACTOR,
        }
    }

    pub fn with_num_arrays_for_new_buffer(mut self, num_arrays: usize) -> Self {
        self.num_arrays_for_new_buffer = num_arrays;
        self
    }

    pub fn with_grow_factor(mut self, factor: f64) -> Self {
        self.alloc_grow_factor = factor.max(0.0);
        self
    }

    /// Restrict the policy to what the owning store can address
    pub fn clamp_max_arrays(mut self, max_arrays: usize) -> Self {
        self.max_arrays = self.max_arrays.min(max_arrays);
        self.min_arrays = self.min_arrays.min(self.max_arrays);
        self.num_arrays_for_new_buffer = self.num_arrays_for_new_buffer.min(self.max_arrays);
        self
    }

    /// Arrays to allocate for a new or resized buffer
    ///
    /// `resizing_used_elems` is the used element count of the buffer being
    /// resized, `None` when a fresh buffer is taken. `previous_arrays` is the
    /// capacity of the buffer being superseded.
    ///
    /// Panics when `max_arrays` cannot satisfy the request.
    pub fn calc_arrays_to_alloc(
        &self,
        array_size: usize,
        reserved_elems: usize,
        elems_needed: usize,
        resizing_used_elems: Option<usize>,
        counts: BufferCounts,
        previous_arrays: usize,
    ) -> usize {
        debug_assert!(counts.used_elems >= counts.dead_elems);
        let base_elems = resizing_used_elems.unwrap_or(reserved_elems);
        let needed_arrays = (elems_needed + base_elems).div_ceil(array_size);
        let live_arrays = (counts.used_elems - counts.dead_elems) / array_size;
        let grow_arrays = (live_arrays as f64 * self.alloc_grow_factor) as usize;
        let used_arrays = resizing_used_elems.unwrap_or(0) / array_size;
        let wanted_arrays = (used_arrays + grow_arrays)
            .max((previous_arrays as f64 * self.alloc_grow_factor) as usize)
            .max(self.min_arrays);

        let result = wanted_arrays.max(needed_arrays).min(self.max_arrays);
        assert!(
            result >= needed_arrays,
            "calc_arrays_to_alloc: {} arrays needed, max is {} (elems_needed={}, array_size={})",
            needed_arrays,
            self.max_arrays,
            elems_needed,
            array_size
        );
        result
    }

    /// Threshold for growing in place, scaled by the number of active buffers
    pub fn scaled_num_arrays_for_new_buffer(&self, active_buffers: usize) -> usize {
        if active_buffers <= 1 || self.num_arrays_for_new_buffer == 0 {
            return self.num_arrays_for_new_buffer;
        }
        let scale = (1.0 + self.alloc_grow_factor).powi(active_buffers as i32 - 1);
        let scaled = self.num_arrays_for_new_buffer as f64 * scale;
        if scaled >= self.max_arrays as f64 {
            self.max_arrays
        } else {
            scaled as usize
        }
    }
}

/// Type handler registered with a data store
///
/// The store treats every registered type through this interface: element
/// geometry, growth policy and the element lifecycle hooks used when buffers
/// are created, resized, cleaned and dropped.
pub trait BufferTypeBase: Send + Sync {
    /// Size of one element in bytes
    fn elem_size(&self) -> usize;

    /// Alignment of one element in bytes
    fn elem_align(&self) -> usize;

    /// Elements per entry; refs address whole arrays
    fn array_size(&self) -> usize;

    /// Rust type of the stored elements
    fn elem_type(&self) -> TypeId;

    fn policy(&self) -> GrowthPolicy;

    /// Elements kept unused at the start of a buffer
    ///
    /// Buffer 0 reserves one array so that the raw ref value 0 never
    /// addresses a real entry.
    fn reserved_elements(&self, buffer_id: u32) -> usize {
        if buffer_id == 0 {
            self.array_size()
        } else {
            0
        }
    }

    /// Write empty entries into the first `num_elems` elements
    ///
    /// # Safety
    /// `buffer` must be valid for `num_elems` uninitialized elements of this type.
    unsafe fn initialize_reserved_elements(&self, buffer: NonNull<u8>, num_elems: usize);

    /// Copy `num_elems` initialized elements from `old` into uninitialized `new`
    ///
    /// # Safety
    /// Both regions must hold at least `num_elems` elements of this type and
    /// must not overlap.
    unsafe fn fallback_copy(&self, new: NonNull<u8>, old: NonNull<u8>, num_elems: usize);

    /// Drop the first `num_elems` elements in place
    ///
    /// # Safety
    /// The elements must be initialized and never used again.
    unsafe fn destroy_elements(&self, buffer: NonNull<u8>, num_elems: usize);

    /// Reset `num_elems` elements starting at `offset` to the empty entry
    ///
    /// # Safety
    /// The elements must be initialized and unobservable by readers.
    unsafe fn clean_hold(&self, buffer: NonNull<u8>, offset: usize, num_elems: usize);
}

/// Type handler for elements of `T`, using `T::default()` as the empty entry
pub struct BufferType<T> {
    array_size: usize,
    policy: GrowthPolicy,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BufferType<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    pub fn new(array_size: usize, min_arrays: usize, max_arrays: usize) -> Self {
        assert!(array_size > 0, "array size must be positive");
        Self {
            array_size,
            policy: GrowthPolicy::new(min_arrays, max_arrays),
            _marker: PhantomData,
        }
    }

    pub fn with_policy(array_size: usize, policy: GrowthPolicy) -> Self {
        assert!(array_size > 0, "array size must be positive");
        Self {
            array_size,
            policy,
            _marker: PhantomData,
        }
    }
}

impl<T> BufferTypeBase for BufferType<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    fn elem_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn elem_align(&self) -> usize {
        std::mem::align_of::<T>()
    }

    fn array_size(&self) -> usize {
        self.array_size
    }

    fn elem_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    unsafe fn initialize_reserved_elements(&self, buffer: NonNull<u8>, num_elems: usize) {
        let base = buffer.cast::<T>().as_ptr();
        for i in 0..num_elems {
            // SAFETY: caller guarantees room for num_elems elements
            unsafe { base.add(i).write(T::default()) };
        }
    }

    unsafe fn fallback_copy(&self, new: NonNull<u8>, old: NonNull<u8>, num_elems: usize) {
        let src = old.cast::<T>().as_ptr();
        let dst = new.cast::<T>().as_ptr();
        for i in 0..num_elems {
            // SAFETY: src elements are initialized, dst has room and is disjoint
            unsafe { dst.add(i).write((*src.add(i)).clone()) };
        }
    }

    unsafe fn destroy_elements(&self, buffer: NonNull<u8>, num_elems: usize) {
        let base = buffer.cast::<T>().as_ptr();
        // SAFETY: caller guarantees num_elems initialized elements
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(base, num_elems)) };
    }

    unsafe fn clean_hold(&self, buffer: NonNull<u8>, offset: usize, num_elems: usize) {
        let base = buffer.cast::<T>().as_ptr();
        for i in offset..offset + num_elems {
            // SAFETY: element is initialized; assignment drops the old value
            unsafe { *base.add(i) = T::default() };
        }
    }
}
