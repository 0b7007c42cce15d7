use super::bits;
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::Ordering;
use crate::sync::cell::UnsafeCell;
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Largest block size served by the slab engine, inclusive.
pub const SMALL_MAX: usize = 512;

// Each size class owns one header page and one data-region reservation.  The
// header carries a single bitmap with one bit per data page (bit set ⇒ that
// page is fully allocated); a header page of PAGE_SIZE bytes indexes
// PAGE_SIZE·8 data pages, so the data region reserves PAGE_SIZE·8·PAGE_SIZE
// bytes.  Each data page starts with its own slot-occupancy bitmap.
//
// Slot capacity comes from the occupancy equation:
//   blockCount/8 + blockCount·blockSize = PageSize
//   blockCount = PageSize·8 / (1 + 8·blockSize)

/// Number of data pages a size class can index — one header-bitmap bit each.
#[inline]
pub(crate) fn data_page_count() -> usize {
    PlatformVmOps::page_size() * 8
}

/// Bytes reserved for a class's data region.
#[inline]
pub(crate) fn data_region_len() -> usize {
    data_page_count() * PlatformVmOps::page_size()
}

/// Slots per data page for the given block size (occupancy equation).
#[inline]
pub(crate) fn block_count(block_size: usize) -> usize {
    PlatformVmOps::page_size() * 8 / (1 + block_size * 8)
}

/// Address of slot 0 within a data page: past the slot bitmap, rounded up to
/// the next multiple of `block_size`.
#[inline]
fn slot_area_addr(page_addr: usize, block_size: usize, count: usize) -> usize {
    let first = page_addr + count.div_ceil(8);
    let rem = first % block_size;
    if rem > 0 {
        first + (block_size - rem)
    } else {
        first
    }
}

/// Usable slots in the page at `page_addr`.
///
/// The occupancy equation ignores the gap inserted to align the slot area, so
/// for awkward block sizes the equation's last slot can spill past the page
/// end. Clamp to the slots that end inside the page; the bitmap layout still
/// uses the unclamped count.
#[inline]
fn usable_slots(page_addr: usize, block_size: usize, count: usize) -> usize {
    let slot_area = slot_area_addr(page_addr, block_size, count);
    let available = page_addr + PlatformVmOps::page_size() - slot_area;
    count.min(available / block_size)
}

/// One small size class: header page, data-region reservation, and the mask
/// of currently committed data pages.
pub(crate) struct SizeClass {
    block_size: usize,
    /// Single committed page; bit `p` set ⇒ data page `p` is fully allocated.
    header: NonNull<u8>,
    /// Reserved (not committed) region of `data_region_len()` bytes.
    data: NonNull<u8>,
    /// Data pages currently backed by physical memory.
    committed: FixedBitSet,
}

// Safety: SizeClass owns its reservations; the raw pointers are not shared.
unsafe impl Send for SizeClass {}

impl SizeClass {
    fn new(block_size: usize) -> Result<Self, VmError> {
        debug_assert!((1..=SMALL_MAX).contains(&block_size));
        let page_size = PlatformVmOps::page_size();

        // Safety: FFI call to reserve memory.
        let header = unsafe { PlatformVmOps::reserve(page_size)? };
        // Safety: FFI call to commit memory.
        if let Err(e) = unsafe { PlatformVmOps::commit(header, page_size) } {
            // Safety: header was just reserved and never handed out.
            unsafe { drop(PlatformVmOps::release(header, page_size)) };
            return Err(e);
        }

        // Safety: FFI call to reserve memory.
        let data = match unsafe { PlatformVmOps::reserve(data_region_len()) } {
            Ok(p) => p,
            Err(e) => {
                // Safety: header was just reserved and never handed out.
                unsafe { drop(PlatformVmOps::release(header, page_size)) };
                return Err(e);
            }
        };

        stats::TOTAL_RESERVED.fetch_add(page_size + data_region_len(), Ordering::Relaxed);
        stats::TOTAL_COMMITTED.fetch_add(page_size, Ordering::Relaxed);
        stats::SMALL_COMMITTED.fetch_add(page_size, Ordering::Relaxed);

        Ok(Self {
            block_size,
            header,
            data,
            committed: FixedBitSet::with_capacity(data_page_count()),
        })
    }

    /// Whether `addr` lies inside this class's data region.  Reservations are
    /// never released while the class is live, so this test is stable.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let start = self.data.as_ptr() as usize;
        addr >= start && addr < start + data_region_len()
    }

    pub(crate) fn alloc(&mut self) -> Result<NonNull<u8>, VmError> {
        let page_size = PlatformVmOps::page_size();
        let header_bits = self.header.as_ptr().cast::<u64>();

        // Header bit clear ⇒ that data page still has room.
        // Safety: the header page is committed and spans the whole bit range.
        let page_index = unsafe { bits::first_clear(header_bits, data_page_count()) }
            .ok_or(VmError::SizeClassExhausted {
                block_size: self.block_size,
            })?;

        let page_addr = self.data.as_ptr() as usize + page_index * page_size;
        if !self.committed.contains(page_index) {
            // Safety: page_addr is page-aligned within our reservation.
            let page_ptr = unsafe { NonNull::new_unchecked(page_addr as *mut u8) };
            // Safety: FFI call to commit memory.
            unsafe { PlatformVmOps::commit(page_ptr, page_size)? };
            self.committed.insert(page_index);
            stats::TOTAL_COMMITTED.fetch_add(page_size, Ordering::Relaxed);
            stats::SMALL_COMMITTED.fetch_add(page_size, Ordering::Relaxed);
        }

        let count = block_count(self.block_size);
        let usable = usable_slots(page_addr, self.block_size, count);
        let page_bits = page_addr as *mut u64;

        // Safety: the page is committed; the bitmap words live inside it.
        let slot = unsafe { bits::first_clear(page_bits, usable) };
        let Some(slot) = slot else {
            // The header claimed this page had a free slot.
            unreachable!(
                "size class {}: header bit clear for page {page_index} but no free slot",
                self.block_size
            );
        };

        // Safety: slot < usable; the bitmap word is inside the committed page.
        unsafe { bits::set_bit(page_bits, slot) };
        // Safety: same range as above.
        if unsafe { bits::all_set(page_bits, usable) } {
            // Safety: page_index < data_page_count(); header page is committed.
            unsafe { bits::set_bit(header_bits, page_index) };
        }

        let addr = slot_area_addr(page_addr, self.block_size, count) + slot * self.block_size;
        debug_assert!(
            addr + self.block_size <= page_addr + page_size,
            "slot {slot} of class {} spills past its page",
            self.block_size
        );
        debug_assert!(addr % self.block_size == 0);

        // Safety: addr is a non-null address inside our committed page.
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    pub(crate) fn free(&mut self, ptr: NonNull<u8>) {
        let page_size = PlatformVmOps::page_size();
        let addr = ptr.as_ptr() as usize;
        let base = self.data.as_ptr() as usize;
        debug_assert!(self.contains(addr), "pointer {ptr:p} is outside this size class");

        let page_index = (addr - base) / page_size;
        let page_addr = base + page_index * page_size;
        debug_assert!(
            self.committed.contains(page_index),
            "pointer {ptr:p} points into a decommitted page (double free after page release?)"
        );

        let count = block_count(self.block_size);
        let slot_area = slot_area_addr(page_addr, self.block_size, count);
        debug_assert!(
            addr >= slot_area && (addr - slot_area).is_multiple_of(self.block_size),
            "pointer {ptr:p} is not a slot of size class {}",
            self.block_size
        );
        let slot = (addr - slot_area) / self.block_size;
        let usable = usable_slots(page_addr, self.block_size, count);
        debug_assert!(slot < usable);

        let page_bits = page_addr as *mut u64;
        #[cfg(debug_assertions)]
        {
            // Safety: slot < usable; bitmap word inside the committed page.
            let was_set = unsafe { bits::test_bit(page_bits, slot) };
            assert!(
                was_set,
                "double free in size class {}: page {page_index}, slot {slot}",
                self.block_size
            );
        }

        // Safety: slot < usable; bitmap word inside the committed page.
        unsafe { bits::clear_bit(page_bits, slot) };

        // Safety: same range.
        if unsafe { bits::all_clear(page_bits, usable) } {
            // Page fully empty — return its physical backing.
            // Safety: page_addr is page-aligned within our reservation.
            let page_ptr = unsafe { NonNull::new_unchecked(page_addr as *mut u8) };
            // Safety: FFI call to decommit memory.
            if unsafe { PlatformVmOps::decommit(page_ptr, page_size) }.is_ok() {
                self.committed.set(page_index, false);
                stats::sub_saturating(&stats::TOTAL_COMMITTED, page_size);
                stats::sub_saturating(&stats::SMALL_COMMITTED, page_size);
            }
        }

        // The header bit means "page known full"; clear it on every free,
        // whether or not the page was full.
        let header_bits = self.header.as_ptr().cast::<u64>();
        // Safety: page_index < data_page_count(); header page is committed.
        unsafe { bits::clear_bit(header_bits, page_index) };
    }

    /// Count of currently committed data pages.
    #[cfg(test)]
    pub(crate) fn committed_pages(&self) -> usize {
        self.committed.count_ones(..)
    }
}

impl Drop for SizeClass {
    fn drop(&mut self) {
        let page_size = PlatformVmOps::page_size();
        let still_committed = self.committed.count_ones(..) * page_size;
        // Safety: we own both reservations and no pointers outlive the class
        // (per-thread ownership; dropped only at thread exit).
        unsafe {
            drop(PlatformVmOps::release(self.header, page_size));
            drop(PlatformVmOps::release(self.data, data_region_len()));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, page_size + data_region_len());
        stats::sub_saturating(&stats::TOTAL_COMMITTED, page_size + still_committed);
        stats::sub_saturating(&stats::SMALL_COMMITTED, page_size + still_committed);
    }
}

/// One thread's array of size classes, indexed by block size.  Classes are
/// lazily created on first use and live until the thread exits.
pub(crate) struct SmallAllocator {
    classes: Vec<Option<SizeClass>>,
}

impl SmallAllocator {
    pub(crate) fn new() -> Self {
        Self {
            classes: (0..SMALL_MAX).map(|_| None).collect(),
        }
    }

    pub(crate) fn alloc(&mut self, block_size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(
            (1..=SMALL_MAX).contains(&block_size),
            "block size {block_size} is not a small class"
        );
        let slot = &mut self.classes[block_size - 1];
        if slot.is_none() {
            *slot = Some(SizeClass::new(block_size)?);
        }
        slot.as_mut().unwrap().alloc()
    }

    /// Free `ptr` if one of this thread's classes owns it.
    /// Returns `false` when no class's data region contains the pointer.
    pub(crate) fn try_free(&mut self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        for class in self.classes.iter_mut().flatten() {
            if class.contains(addr) {
                class.free(ptr);
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn class(&self, block_size: usize) -> Option<&SizeClass> {
        self.classes[block_size - 1].as_ref()
    }
}

/// Per-thread handle owning the thread's size-class tables.
///
/// # Safety
///
/// `tables` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS). Neither `alloc` nor `try_free` re-enter the
/// TLS access point — they talk to the VM layer directly.
struct SmallTablesHandle {
    tables: UnsafeCell<SmallAllocator>,
}

// Safety: SmallTablesHandle is confined to a single thread via thread_local!.
unsafe impl Sync for SmallTablesHandle {}

impl SmallTablesHandle {
    fn new() -> Self {
        Self {
            tables: UnsafeCell::new(SmallAllocator::new()),
        }
    }
}

thread_local! {
    static SMALL_TABLES: SmallTablesHandle = SmallTablesHandle::new();
}

/// Run `f` against the calling thread's size-class tables.
pub(crate) fn with_tables<R>(f: impl FnOnce(&mut SmallAllocator) -> R) -> R {
    SMALL_TABLES.with(|handle| {
        // Safety: single-threaded TLS access (see struct-level safety comment)
        let tables = crate::sync::unsafe_cell_get_mut!(handle.tables);
        f(tables)
    })
}
