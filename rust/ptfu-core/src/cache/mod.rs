// rust/ptfu-core/src/cache/mod.rs

//! Two-tier record caching: an in-process [`MemCache`] per reader and a
//! temporary-directory [`DiskCache`] shared through a [`DiskCacheRegistry`].

mod disk;
pub mod entry;
mod memory;
mod registry;

pub use disk::DiskCache;
pub use memory::MemCache;
pub use registry::{DiskCacheLease, DiskCacheRegistry};
