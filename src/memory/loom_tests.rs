//! Loom models for the mutex-guarded regimes.
//!
//! The VM layer is heap-backed under `cfg(loom)` (see `vm.rs`), so these
//! models exercise only the synchronization structure: a coarse mutex over
//! the buddy directory and the large registry, shared across threads.
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --release loom_`
#![cfg(all(test, loom))]

use super::buddy::BuddyAllocator;
use super::large::LargeRegistry;
use crate::sync::{Arc, Mutex};
use std::ptr::NonNull;

#[test]
fn loom_concurrent_medium_allocs_are_disjoint() {
    loom::model(|| {
        let dir = Arc::new(Mutex::new(BuddyAllocator::new()));

        let handle = {
            let dir = dir.clone();
            loom::thread::spawn(move || {
                let ptr = dir.lock().unwrap().alloc(1024).unwrap();
                ptr.as_ptr() as usize
            })
        };

        let mine = dir.lock().unwrap().alloc(2048).unwrap().as_ptr() as usize;
        let theirs = handle.join().unwrap();

        // Two outstanding blocks never share a byte.
        assert!(mine + 2048 <= theirs || theirs + 1024 <= mine);

        let mut guard = dir.lock().unwrap();
        assert!(guard.try_free(NonNull::new(mine as *mut u8).unwrap()));
        assert!(guard.try_free(NonNull::new(theirs as *mut u8).unwrap()));
    });
}

#[test]
fn loom_concurrent_alloc_free_keeps_directory_consistent() {
    loom::model(|| {
        let dir = Arc::new(Mutex::new(BuddyAllocator::new()));

        // Seed one block so the free contends with a concurrent alloc.
        let seeded = dir.lock().unwrap().alloc(1024).unwrap().as_ptr() as usize;

        let handle = {
            let dir = dir.clone();
            loom::thread::spawn(move || {
                let ptr = dir.lock().unwrap().alloc(1024).unwrap();
                dir.lock().unwrap().try_free(ptr)
            })
        };

        assert!(dir
            .lock()
            .unwrap()
            .try_free(NonNull::new(seeded as *mut u8).unwrap()));
        assert!(handle.join().unwrap());

        // Whatever the interleaving, everything freed ⇒ fully coalesced.
        assert!(dir.lock().unwrap().all_chunks_coalesced());
    });
}

#[test]
fn loom_concurrent_large_mappings() {
    loom::model(|| {
        let registry = Arc::new(Mutex::new(LargeRegistry::new()));

        let handle = {
            let registry = registry.clone();
            loom::thread::spawn(move || {
                let ptr = registry.lock().unwrap().map(8192, 4096).unwrap();
                let addr = ptr.as_ptr() as usize;
                assert!(registry
                    .lock()
                    .unwrap()
                    .try_unmap(NonNull::new(addr as *mut u8).unwrap()));
                addr
            })
        };

        let mine = registry.lock().unwrap().map(8192, 4096).unwrap();
        let theirs = handle.join().unwrap();
        assert_ne!(mine.as_ptr() as usize, theirs);

        assert!(registry.lock().unwrap().try_unmap(mine));
    });
}
