use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::Error;
use crate::Equivalent;

/// [`Bucket`] is a lock-protected chain of entries sharing the same stripe
/// index.
///
/// The lock guards every structural change to the chain; holding it for the
/// whole read-compute-write sequence of a compound operation is what makes
/// the operation atomic for keys routed to this bucket.
#[repr(align(64))]
pub(super) struct Bucket<K, V> {
    chain: Mutex<Chain<K, V>>,
}

/// [`Chain`] is the bucket-owned entry list plus the forwarding sentinel.
pub(super) struct Chain<K, V> {
    /// Entries in insertion order.
    entries: Vec<Entry<K, V>>,
    /// Set once the chain has been migrated to the successor bucket array.
    ///
    /// A forwarded chain is permanently empty; operations that observe the
    /// flag must retry against the successor array.
    forwarded: bool,
}

/// An owned (hash, key, value) triple.
///
/// The hash is stored alongside the key so that migration never has to
/// re-hash and lookups can skip full key comparisons on mismatching hashes.
pub(super) struct Entry<K, V> {
    pub(super) hash: u64,
    pub(super) key: K,
    pub(super) val: V,
}

impl<K, V> Bucket<K, V> {
    pub(super) fn new() -> Self {
        Self {
            chain: Mutex::new(Chain {
                entries: Vec::new(),
                forwarded: false,
            }),
        }
    }

    /// Acquires the chain lock, waiting indefinitely.
    #[inline]
    pub(super) fn lock(&self) -> MutexGuard<'_, Chain<K, V>> {
        self.chain.lock()
    }

    /// Acquires the chain lock, waiting at most `wait_limit` if one is given.
    #[inline]
    pub(super) fn lock_with_limit(
        &self,
        wait_limit: Option<Duration>,
    ) -> Result<MutexGuard<'_, Chain<K, V>>, Error> {
        match wait_limit {
            None => Ok(self.chain.lock()),
            Some(limit) => self.chain.try_lock_for(limit).ok_or(Error::LockTimeout),
        }
    }
}

impl<K, V> Chain<K, V> {
    #[inline]
    pub(super) fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Marks the chain forwarded and takes its entries for migration.
    ///
    /// The bucket lock must be held; the flag and the removal of the entries
    /// become visible to other threads as a single action when the lock is
    /// released.
    pub(super) fn forward(&mut self) -> Vec<Entry<K, V>> {
        debug_assert!(!self.forwarded);
        self.forwarded = true;
        std::mem::take(&mut self.entries)
    }

    #[inline]
    pub(super) fn entry(&self, index: usize) -> &Entry<K, V> {
        &self.entries[index]
    }

    #[inline]
    pub(super) fn entry_mut(&mut self, index: usize) -> &mut Entry<K, V> {
        &mut self.entries[index]
    }

    #[inline]
    pub(super) fn push(&mut self, entry: Entry<K, V>) {
        debug_assert!(!self.forwarded);
        self.entries.push(entry);
    }

    /// Removes and returns the entry at `index`, preserving chain order.
    #[inline]
    pub(super) fn remove(&mut self, index: usize) -> Entry<K, V> {
        self.entries.remove(index)
    }

    /// Drops every entry for which `pred` returns `false`.
    ///
    /// Returns the number of removed entries.
    pub(super) fn retain<F: FnMut(&mut Entry<K, V>) -> bool>(&mut self, mut pred: F) -> usize {
        let len = self.entries.len();
        self.entries.retain_mut(|entry| pred(entry));
        len - self.entries.len()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &Entry<K, V>> {
        self.entries.iter()
    }
}

impl<K: Eq, V> Chain<K, V> {
    /// Returns the position of the entry containing the key, comparing by
    /// equality rather than identity.
    #[inline]
    pub(super) fn position<Q>(&self, key: &Q, hash: u64) -> Option<usize>
    where
        Q: Equivalent<K> + ?Sized,
    {
        self.entries
            .iter()
            .position(|entry| entry.hash == hash && key.equivalent(&entry.key))
    }
}
