//! # Non-blocking hashmap
//!
//! A lock-free open-addressing map from non-zero `u64` keys to `u64`
//! values with cooperative, incremental resizing ([`Nbhm`]), and the
//! epoch-based reclamation that frees retired table generations
//! ([`ebr::Collector`]).
//!
//! ```rust
//! use kernel_nbhm::{Nbhm, ebr::Collector};
//!
//! let collector = Collector::new(1);
//! let map = Nbhm::with_capacity(64);
//!
//! let guard = collector.pin(0);
//! map.put(&guard, 0x1000, 42).unwrap();
//! assert_eq!(map.get(&guard, 0x1000), Some(42));
//! ```
//!
//! The kernel uses it as the per-address-space commit table (page base →
//! physical frame) and for handle interning.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod ebr;
mod hash;
mod map;

pub use hash::{AddressHasher, KeyHasher};
pub use map::{LOAD_FACTOR, MOVE_AMOUNT, MapError, Nbhm, TOMBSTONE, compute_cap};
