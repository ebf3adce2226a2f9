use std::sync::atomic::Ordering::{Acquire, Release};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use super::bucket::Bucket;
use crate::error::Error;

/// [`BucketArray`] is a power-of-two array of [`Bucket`] instances.
///
/// It routes a key hash to a bucket index and carries the link to the
/// successor array while a migration is in progress. The array itself is
/// never mutated in place; growth replaces it wholesale.
pub(super) struct BucketArray<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    /// The enlarged array that forwarded chains have been migrated to.
    ///
    /// Installed before the first chain is forwarded, and immutable once set;
    /// `null` whenever no migration involving this array is under way.
    next: AtomicShared<BucketArray<K, V>>,
}

impl<K, V> BucketArray<K, V> {
    /// Creates a [`BucketArray`] with `num_buckets` empty buckets.
    ///
    /// `num_buckets` must be a power of two.
    pub(super) fn new(num_buckets: usize) -> Self {
        debug_assert!(num_buckets.is_power_of_two());
        Self {
            buckets: (0..num_buckets).map(|_| Bucket::new()).collect(),
            next: AtomicShared::null(),
        }
    }

    /// Creates a [`BucketArray`] like [`BucketArray::new`], except that an
    /// allocation failure is reported instead of aborting the process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the allocation fails.
    pub(super) fn try_new(num_buckets: usize) -> Result<Self, Error> {
        debug_assert!(num_buckets.is_power_of_two());

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(num_buckets)
            .map_err(|_| Error::ResourceExhausted)?;
        (0..num_buckets).for_each(|_| buckets.push(Bucket::new()));
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            next: AtomicShared::null(),
        })
    }

    /// Returns the number of buckets in the array.
    #[inline]
    pub(super) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Calculates the bucket index for the hash value.
    #[inline]
    pub(super) fn bucket_index(&self, hash: u64) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let hash = hash as usize;
        hash & (self.buckets.len() - 1)
    }

    /// Returns a reference to the bucket at the given position.
    #[inline]
    pub(super) fn bucket(&self, index: usize) -> &Bucket<K, V> {
        debug_assert!(index < self.buckets.len());
        &self.buckets[index]
    }

    /// Returns a [`Ptr`] to the successor array.
    #[inline]
    pub(super) fn next_array<'g>(&self, guard: &'g Guard) -> Ptr<'g, BucketArray<K, V>> {
        self.next.load(Acquire, guard)
    }
}

impl<K: 'static, V: 'static> BucketArray<K, V> {
    /// Installs the successor array.
    ///
    /// Must happen before any chain in this array is forwarded, so that a
    /// thread observing a forwarded chain always finds a successor.
    #[inline]
    pub(super) fn link_next(&self, next: Shared<BucketArray<K, V>>) {
        debug_assert!(self.next.is_null(Acquire));
        self.next.swap((Some(next), Tag::None), Release);
    }
}

#[cfg(test)]
mod test {
    use super::BucketArray;

    #[test]
    fn bucket_index_masks_hash() {
        let array: BucketArray<u64, u64> = BucketArray::try_new(16).unwrap();
        assert_eq!(array.num_buckets(), 16);
        for hash in 0..64_u64 {
            assert_eq!(array.bucket_index(hash), (hash % 16) as usize);
        }
        assert_eq!(array.bucket_index(u64::MAX), 15);
    }
}
