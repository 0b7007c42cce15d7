use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::Ordering;
use crate::sync::{Mutex, OnceLock};
use std::ptr::NonNull;

/// Maximum number of live large mappings.
pub(crate) const LARGE_REGISTRY_CAPACITY: usize = 256;

/// Bookkeeping for one live large mapping.
///
/// `user_addr` differs from `base` only for over-aligned requests
/// (alignment > page size), where the mapping is padded by the alignment and
/// an aligned interior pointer is handed out. On unmap we need the original
/// base and total length to release the whole mapping.
struct LargeBlock {
    user_addr: usize,
    base: NonNull<u8>,
    mapped: usize,
}

/// Bounded table of live large mappings. Entries live from `map` to the
/// matching `try_unmap`.
pub(crate) struct LargeRegistry {
    entries: Vec<Option<LargeBlock>>,
}

// Safety: LargeRegistry owns its mappings; the raw pointers are not shared.
unsafe impl Send for LargeRegistry {}

impl LargeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: (0..LARGE_REGISTRY_CAPACITY).map(|_| None).collect(),
        }
    }

    /// Map a fresh OS-backed region of at least `block_size` bytes, aligned
    /// to `alignment`, and record it.
    pub(crate) fn map(&mut self, block_size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(VmError::LargeRegistryFull)?;

        let page_size = PlatformVmOps::page_size();
        let (base, mapped, user_addr) = if alignment > page_size {
            // The OS only aligns mappings to the page size; pad by the
            // alignment and hand out an aligned interior pointer.
            let mapped = block_size.checked_add(alignment).ok_or_else(|| {
                VmError::MapFailed(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "large mapping size overflow",
                ))
            })?;
            // Safety: FFI call to map memory.
            let base = unsafe { PlatformVmOps::map_large(mapped)? };
            let aligned = (base.as_ptr() as usize + alignment - 1) & !(alignment - 1);
            (base, mapped, aligned)
        } else {
            // Safety: FFI call to map memory.
            let base = unsafe { PlatformVmOps::map_large(block_size)? };
            (base, block_size, base.as_ptr() as usize)
        };

        stats::TOTAL_RESERVED.fetch_add(mapped, Ordering::Relaxed);
        stats::TOTAL_COMMITTED.fetch_add(mapped, Ordering::Relaxed);
        stats::LARGE_MAPPED.fetch_add(mapped, Ordering::Relaxed);

        self.entries[slot] = Some(LargeBlock {
            user_addr,
            base,
            mapped,
        });

        // Safety: user_addr is non-null, inside the fresh mapping.
        Ok(unsafe { NonNull::new_unchecked(user_addr as *mut u8) })
    }

    /// Unmap `ptr` if the registry holds it. Returns `false` when no entry
    /// matches, leaving the registry untouched.
    pub(crate) fn try_unmap(&mut self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        for entry in &mut self.entries {
            if entry.as_ref().is_some_and(|e| e.user_addr == addr) {
                let block = entry.take().unwrap();
                // Safety: FFI call to unmap; the entry owned this mapping.
                unsafe {
                    drop(PlatformVmOps::unmap_large(block.base, block.mapped));
                }
                stats::sub_saturating(&stats::TOTAL_RESERVED, block.mapped);
                stats::sub_saturating(&stats::TOTAL_COMMITTED, block.mapped);
                stats::sub_saturating(&stats::LARGE_MAPPED, block.mapped);
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

impl Drop for LargeRegistry {
    fn drop(&mut self) {
        for entry in &mut self.entries {
            if let Some(block) = entry.take() {
                // Safety: FFI call to unmap; the entry owned this mapping.
                unsafe {
                    drop(PlatformVmOps::unmap_large(block.base, block.mapped));
                }
                stats::sub_saturating(&stats::TOTAL_RESERVED, block.mapped);
                stats::sub_saturating(&stats::TOTAL_COMMITTED, block.mapped);
                stats::sub_saturating(&stats::LARGE_MAPPED, block.mapped);
            }
        }
    }
}

static GLOBAL_LARGE: OnceLock<Mutex<LargeRegistry>> = OnceLock::new();

/// Process-wide large-block registry behind a coarse mutex.
pub(crate) struct GlobalLargeRegistry;

impl GlobalLargeRegistry {
    fn instance() -> &'static Mutex<LargeRegistry> {
        GLOBAL_LARGE.get_or_init(|| Mutex::new(LargeRegistry::new()))
    }

    /// Map and register a large block.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the registry is full or the mapping fails.
    pub(crate) fn map(block_size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
        Self::instance().lock().unwrap().map(block_size, alignment)
    }

    /// Unmap `ptr` if the large regime owns it; `false` otherwise.
    ///
    /// # Safety
    /// If an entry matches `ptr`, the caller must not use the mapping
    /// afterwards.
    pub(crate) unsafe fn try_unmap(ptr: NonNull<u8>) -> bool {
        Self::instance().lock().unwrap().try_unmap(ptr)
    }
}
