pub(crate) mod bits;
pub(crate) mod buddy;
pub(crate) mod large;
pub(crate) mod loom_tests;
pub(crate) mod manager;
pub(crate) mod small;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
