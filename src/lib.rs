#[cfg(not(target_pointer_width = "64"))]
compile_error!("stratum supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// front door
pub use memory::manager::{allocate, free, MemoryManager, MemoryStats};

// regime boundaries
pub use memory::buddy::{
    BUDDY_CHUNK_BLOCKS, BUDDY_CHUNK_BYTES, BUDDY_CHUNK_CAPACITY, MEDIUM_MAX, SMALLEST_BUDDY_BLOCK,
};
pub use memory::small::SMALL_MAX;

// errors
pub use memory::vm::VmError;
