#![doc(
    html_logo_url = "https://raw.githubusercontent.com/vertexclique/kovan/master/art/kovan-square.svg"
)]
//! # Kovan SyncMap
//!
//! `kovan-syncmap` is a concurrent map for read-mostly workloads where the key
//! set is stable: caches that are filled once and read many times, registries
//! whose entries are updated in place, per-key state touched by many threads.
//!
//! ## How it works
//!
//! The map keeps two views of its contents:
//!
//! - A **snapshot**: an immutable table published through an atomic pointer.
//!   Lookups, updates and deletes of keys found here never take a lock.
//! - An **overlay**: a mutable table behind a mutex that admits new keys.
//!
//! Every lookup that has to consult the overlay counts as a miss. Once misses
//! catch up with the overlay size, the overlay is promoted to be the new
//! snapshot, so a stable key set converges to an entirely lock-free state.
//!
//! Each key owns an atomic cell whose value is `Present`, `Absent` (deleted,
//! cheaply revivable) or `Expunged` (deleted and dropped from the overlay).
//! Replaced cells are reclaimed with epoch-based reclamation.
//!
//! ## Example
//!
//! ```rust
//! use kovan_syncmap::SyncMap;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map = Arc::new(SyncMap::new());
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 map.store(t * 100 + i, i);
//!             }
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//!
//! assert_eq!(map.len(), 400);
//! assert_eq!(map.load(&205), Some(5));
//! ```

#![warn(missing_docs)]

mod entry;
mod map;
mod overlay;
mod snapshot;

pub use crate::map::{DefaultHashBuilder, SyncMap};
