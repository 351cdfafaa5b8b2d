#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]

//! Single-flight caches for async computations.
//!
//! [`LatestValueCache`] memoizes the latest outcome of one producer and never runs that
//! producer twice at once. [`MapCache`] does the same per key, and the [`memman`] registry
//! can release the memory of enrolled caches in one sweep.

pub mod cached;
pub mod map_cache;
pub mod memman;
pub mod outcome;

use std::{future::Future, pin::Pin};

pub use cached::LatestValueCache;
pub use map_cache::MapCache;
pub use memman::{MemoryManager, MemoryStats, MEMORY_MANAGER};
pub use outcome::{CacheError, Outcome};

pub type BoxFut<'a, O> = Pin<Box<dyn Future<Output = O> + Send + 'a>>;
