//! Striped concurrent hash map.
//!
//! # [`HashMap`]
//! A thread-safe hash map built on lock striping: every bucket owns its own
//! lock, compound operations such as [`HashMap::compute`] and
//! [`HashMap::merge`] are atomic per key, and the bucket array grows
//! incrementally without stopping readers or writers on unrelated buckets.

#![warn(missing_docs)]

mod counter;

mod error;
pub use error::Error;

#[cfg(feature = "equivalent")]
pub use equivalent::Equivalent;
#[cfg(not(feature = "equivalent"))]
mod equivalent;
#[cfg(not(feature = "equivalent"))]
pub use crate::equivalent::Equivalent;

pub mod hash_map;
pub use hash_map::{HashMap, Iter, Options};

#[cfg(feature = "serde")]
mod serde;
