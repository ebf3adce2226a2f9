//! [`HashMap`] is a striped, thread-safe hash map with atomic compound
//! operations.

mod bucket;
mod bucket_array;

use std::collections::hash_map::RandomState;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FusedIterator;
use std::mem::replace;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::time::Duration;

use parking_lot::MutexGuard;
use sdd::{AtomicShared, Guard, Shared, Tag};

use crate::counter::Counter;
use crate::error::Error;
use crate::Equivalent;
use bucket::{Chain, Entry};
use bucket_array::BucketArray;

/// Striped concurrent hash map.
///
/// [`HashMap`] partitions its entries over an array of buckets where each
/// bucket owns the lock guarding its own chain of entries. Operations on
/// different buckets never serialize against each other; operations on the
/// same key are serialized by a single bucket lock, which is also what makes
/// the compound operations ([`compute`](Self::compute),
/// [`merge`](Self::merge), [`insert_if_absent`](Self::insert_if_absent), and
/// friends) atomic: the whole read-compute-write sequence happens under one
/// lock hold, so no other thread can observe or act on the key in between.
///
/// ## Growth
///
/// When the entry count exceeds `load_factor * capacity`, the inserting
/// thread that notices the condition becomes the migration coordinator: it
/// allocates a doubled bucket array and relocates chains one bucket at a
/// time, leaving a forwarding mark behind. Operations that encounter a
/// forwarded bucket transparently retry against the new array, so growth
/// never blocks operations on unrelated buckets. Replaced arrays are
/// reclaimed through [`sdd`] once no thread can reach them.
///
/// ## Consistency
///
/// [`HashMap::len`] is approximate: it is maintained by sharded counters and
/// is only guaranteed to be consistent with completed operations.
/// [`HashMap::for_each`] and [`HashMap::iter`] are weakly consistent: every
/// entry present for the whole traversal is observed at least once, entries
/// mutated mid-traversal may be observed zero, one, or two times, and
/// concurrent mutation during a traversal is legal, never an error.
///
/// ## Caller-supplied closures
///
/// Closures passed to the compound operations run inside the bucket lock.
/// They must not block on external I/O and must not call back into the map,
/// as doing so can deadlock; this is a documented precondition, not checked
/// at runtime. A panicking closure unwinds through the operation with the
/// lock released and the entry exactly as it was before the call.
pub struct HashMap<K, V, H = RandomState>
where
    H: BuildHasher,
{
    array: AtomicShared<BucketArray<K, V>>,
    num_entries: Counter,
    load_factor: f64,
    lock_wait_limit: Option<Duration>,
    build_hasher: H,
}

/// Construction parameters for a [`HashMap`].
///
/// # Examples
///
/// ```
/// use stripemap::{HashMap, Options};
///
/// let options = Options {
///     initial_capacity: 64,
///     load_factor: 0.5,
///     ..Options::default()
/// };
/// let hashmap: HashMap<u64, u32> = HashMap::with_options(options).unwrap();
///
/// assert_eq!(hashmap.capacity(), 64);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Desired number of buckets, rounded up to the next power of two.
    pub initial_capacity: usize,

    /// The entry-count-to-bucket-count ratio that triggers growth.
    ///
    /// Must be finite and in `(0, 1]`.
    pub load_factor: f64,

    /// Upper bound on the time an operation may wait for a bucket lock.
    ///
    /// `None` waits indefinitely. When a limit is set, an operation that
    /// cannot acquire the bucket lock in time fails with
    /// [`Error::LockTimeout`] and has no effect.
    pub lock_wait_limit: Option<Duration>,
}

/// An owning iterator over the entries of a [`HashMap`].
///
/// The traversal is lazy and weakly consistent: buckets are visited in index
/// order, one bucket's entries are cloned at a time under that bucket's
/// lock, and no map-wide lock is ever taken. The iterator remains valid if
/// the map is resized, mutated, or even dropped while iterating.
pub struct Iter<K, V> {
    array: Option<Shared<BucketArray<K, V>>>,
    index: usize,
    pending: VecDeque<(K, V)>,
}

/// The default number of buckets.
const DEFAULT_CAPACITY: usize = 16;

/// The default growth trigger: grow when more than 7/8 of the buckets are
/// occupied on average.
const DEFAULT_LOAD_FACTOR: f64 = 0.875;

/// The smallest permitted bucket array length.
const MIN_TABLE_LEN: usize = 4;

/// The largest permitted bucket array length.
const MAX_TABLE_LEN: usize = 1_usize << (usize::BITS - 2);

impl Default for Options {
    #[inline]
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            lock_wait_limit: None,
        }
    }
}

impl<K: 'static, V: 'static> HashMap<K, V, RandomState> {
    /// Creates an empty [`HashMap`] with the default capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::new();
    ///
    /// assert_eq!(hashmap.capacity(), 16);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    /// Creates an empty [`HashMap`] with the specified capacity.
    ///
    /// The actual capacity is the given value rounded up to the next power
    /// of two.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::with_capacity(1000);
    ///
    /// assert_eq!(hashmap.capacity(), 1024);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// Creates an empty [`HashMap`] from the supplied [`Options`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the load factor is not a finite
    /// value in `(0, 1]`; the argument check happens before any allocation,
    /// so a rejected call leaves nothing behind.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::{HashMap, Options};
    ///
    /// let invalid = Options {
    ///     load_factor: 1.5,
    ///     ..Options::default()
    /// };
    /// assert!(HashMap::<u64, u32>::with_options(invalid).is_err());
    /// ```
    #[inline]
    pub fn with_options(options: Options) -> Result<Self, Error> {
        Self::with_options_and_hasher(options, RandomState::new())
    }
}

impl<K: 'static, V: 'static> Default for HashMap<K, V, RandomState> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: 'static, V: 'static, H: BuildHasher> HashMap<K, V, H> {
    /// Creates an empty [`HashMap`] with the given [`BuildHasher`].
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::build(Options::default(), build_hasher)
    }

    /// Creates an empty [`HashMap`] with the specified capacity and
    /// [`BuildHasher`].
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: H) -> Self {
        Self::build(
            Options {
                initial_capacity: capacity,
                ..Options::default()
            },
            build_hasher,
        )
    }

    /// Creates an empty [`HashMap`] from the supplied [`Options`] and
    /// [`BuildHasher`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the load factor is not a finite
    /// value in `(0, 1]`.
    #[inline]
    pub fn with_options_and_hasher(options: Options, build_hasher: H) -> Result<Self, Error> {
        if !options.load_factor.is_finite()
            || options.load_factor <= 0.0
            || options.load_factor > 1.0
        {
            return Err(Error::InvalidArgument("load factor must be in (0, 1]"));
        }
        Ok(Self::build(options, build_hasher))
    }

    /// Returns a reference to the [`BuildHasher`].
    #[inline]
    pub fn hasher(&self) -> &H {
        &self.build_hasher
    }

    /// Returns the current number of buckets.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::with_capacity(17);
    ///
    /// assert_eq!(hashmap.capacity(), 32);
    /// ```
    #[inline]
    pub fn capacity(&self) -> usize {
        let guard = Guard::new();
        self.current_array(&guard).num_buckets()
    }

    /// Returns the number of entries.
    ///
    /// The count is maintained by sharded counters and is approximate: it is
    /// consistent with every completed operation but may be stale relative
    /// to operations racing with the call.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_entries.sum()
    }

    /// Returns `true` if the map contains no entries.
    ///
    /// Subject to the same consistency caveat as [`HashMap::len`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(options: Options, build_hasher: H) -> Self {
        let num_buckets = options
            .initial_capacity
            .clamp(MIN_TABLE_LEN, MAX_TABLE_LEN)
            .next_power_of_two();
        Self {
            array: AtomicShared::from(Shared::new(BucketArray::new(num_buckets))),
            num_entries: Counter::new(),
            load_factor: options.load_factor,
            lock_wait_limit: options.lock_wait_limit,
            build_hasher,
        }
    }

    /// Returns the hash value of the key.
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns a reference to the current bucket array.
    #[inline]
    fn current_array<'g>(&self, guard: &'g Guard) -> &'g BucketArray<K, V> {
        let array_ptr = self.array.load(Acquire, guard);
        // The array pointer is initialized at construction and never cleared.
        unsafe { array_ptr.as_ref().unwrap_unchecked() }
    }

    /// Locks the chain that currently owns the hash value.
    ///
    /// Starts at the current array and follows forwarding into successor
    /// arrays until a non-forwarded chain is locked.
    fn lock_chain<'g>(
        &self,
        hash: u64,
        wait_limit: Option<Duration>,
        guard: &'g Guard,
    ) -> Result<MutexGuard<'g, Chain<K, V>>, Error> {
        let mut array = self.current_array(guard);
        loop {
            let index = array.bucket_index(hash);
            let chain = array.bucket(index).lock_with_limit(wait_limit)?;
            if !chain.is_forwarded() {
                return Ok(chain);
            }
            drop(chain);
            // A forwarded chain always has a successor array installed.
            array = unsafe { array.next_array(guard).as_ref().unwrap_unchecked() };
        }
    }

    /// Visits every entry reachable from the bucket at `index`, following
    /// forwarding into the successor array.
    ///
    /// Returns `Ok(false)` if the visitor requested an early exit.
    fn walk_bucket<F: FnMut(&K, &V) -> bool>(
        &self,
        array: &BucketArray<K, V>,
        index: usize,
        wait_limit: Option<Duration>,
        guard: &Guard,
        visitor: &mut F,
    ) -> Result<bool, Error> {
        let chain = array.bucket(index).lock_with_limit(wait_limit)?;
        if chain.is_forwarded() {
            drop(chain);
            // A forwarded chain always has a successor array installed; the
            // chain's entries were split over the two successor buckets.
            let next = unsafe { array.next_array(guard).as_ref().unwrap_unchecked() };
            if !self.walk_bucket(next, index, wait_limit, guard, visitor)? {
                return Ok(false);
            }
            return self.walk_bucket(next, index + array.num_buckets(), wait_limit, guard, visitor);
        }
        for entry in chain.iter() {
            if !visitor(&entry.key, &entry.val) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Visits every entry with an unbounded lock wait, returning `false` on
    /// the first entry the predicate rejects.
    fn all_entries<F: FnMut(&K, &V) -> bool>(&self, mut pred: F) -> bool {
        let guard = Guard::new();
        let array = self.current_array(&guard);
        for index in 0..array.num_buckets() {
            match self.walk_bucket(array, index, None, &guard, &mut pred) {
                Ok(true) => (),
                Ok(false) | Err(_) => return false,
            }
        }
        true
    }

    /// Grows the bucket array if the load factor is exceeded.
    fn check_capacity(&self, guard: &Guard) -> Result<(), Error> {
        let num_buckets = self.current_array(guard).num_buckets();
        if num_buckets < MAX_TABLE_LEN && self.num_entries.sum() > self.grow_threshold(num_buckets)
        {
            self.try_grow(guard)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    #[inline]
    fn grow_threshold(&self, num_buckets: usize) -> usize {
        (num_buckets as f64 * self.load_factor) as usize
    }

    /// Doubles the bucket array and migrates every chain into it.
    ///
    /// Only one thread coordinates a migration at a time: candidates race to
    /// tag the array pointer, and losers return immediately and continue
    /// operating on the old array. The coordinator migrates chains bucket by
    /// bucket under the respective bucket locks, then publishes the fully
    /// migrated array and clears the tag in a single atomic swap.
    fn try_grow(&self, guard: &Guard) -> Result<(), Error> {
        let array_ptr = self.array.load(Acquire, guard);
        if array_ptr.tag() != Tag::None {
            // A migration is already under way.
            return Ok(());
        }

        // The array pointer is initialized at construction and never cleared.
        let old_array = unsafe { array_ptr.as_ref().unwrap_unchecked() };
        let old_len = old_array.num_buckets();
        if old_len >= MAX_TABLE_LEN {
            return Ok(());
        }
        if !self
            .array
            .update_tag_if(Tag::First, |ptr| ptr == array_ptr, Relaxed, Relaxed)
        {
            // Lost the coordinator election.
            return Ok(());
        }

        // This thread now owns the migration; the tag must be cleared on
        // every exit path.
        let new_array = match BucketArray::try_new(old_len * 2) {
            Ok(array) => Shared::new(array),
            Err(error) => {
                self.array.update_tag_if(Tag::None, |_| true, Relaxed, Relaxed);
                return Err(error);
            }
        };
        old_array.link_next(new_array.clone());
        for index in 0..old_len {
            Self::migrate_bucket(old_array, &new_array, index);
        }
        self.array.swap((Some(new_array), Tag::None), Release);
        Ok(())
    }

    /// Splits one chain of `old_array` over the two successor buckets.
    ///
    /// The old chain is marked forwarded and emptied under its own lock, so
    /// a thread that observes the mark is guaranteed to find the entries in
    /// the successor array.
    fn migrate_bucket(
        old_array: &BucketArray<K, V>,
        new_array: &Shared<BucketArray<K, V>>,
        index: usize,
    ) {
        let old_len = old_array.num_buckets();
        let mut old_chain = old_array.bucket(index).lock();
        let mut low_chain = new_array.bucket(index).lock();
        let mut high_chain = new_array.bucket(index + old_len).lock();
        for entry in old_chain.forward() {
            if new_array.bucket_index(entry.hash) == index {
                low_chain.push(entry);
            } else {
                high_chain.push(entry);
            }
        }
    }
}

impl<K: 'static + Eq + Hash, V: 'static, H: BuildHasher> HashMap<K, V, H> {
    /// Reads the entry associated with the key.
    ///
    /// The reader closure runs under the bucket lock, therefore it observes
    /// either the state before or the state after any concurrent compound
    /// operation on the same key, never an intermediate one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), None);
    /// assert_eq!(hashmap.insert(1, 10).unwrap(), None);
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), Some(10));
    /// ```
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Result<Option<R>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash(key);
        let chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        Ok(chain.position(key, hash).map(|index| {
            let entry = chain.entry(index);
            reader(&entry.key, &entry.val)
        }))
    }

    /// Returns `true` if the map contains the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> Result<bool, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        Ok(self.read(key, |_, _| ())?.is_some())
    }

    /// Inserts a key-value pair, replacing and returning the previous value
    /// if the key was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires; the map is unchanged in that case. Returns
    /// [`Error::ResourceExhausted`] if the insertion triggered a growth
    /// attempt whose allocation failed; the insertion itself has taken
    /// effect, and the map remains usable at its current capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert(1, 0).unwrap(), None);
    /// assert_eq!(hashmap.insert(1, 1).unwrap(), Some(0));
    /// ```
    #[inline]
    pub fn insert(&self, key: K, val: V) -> Result<Option<V>, Error> {
        let guard = Guard::new();
        let hash = self.hash(&key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        let prev = match chain.position(&key, hash) {
            Some(index) => Some(replace(&mut chain.entry_mut(index).val, val)),
            None => {
                chain.push(Entry { hash, key, val });
                None
            }
        };
        let inserted = prev.is_none();
        drop(chain);
        if inserted {
            self.num_entries.add(1);
            self.check_capacity(&guard)?;
        }
        Ok(prev)
    }

    /// Removes the entry associated with the key and returns its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert(1, 0).unwrap(), None);
    /// assert_eq!(hashmap.remove(&1).unwrap(), Some(0));
    /// assert_eq!(hashmap.remove(&1).unwrap(), None);
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Result<Option<V>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.remove_if(key, |_| true)
    }

    /// Removes the entry associated with the key if the condition holds for
    /// its current value.
    ///
    /// The condition is evaluated under the bucket lock, at the instant of
    /// the atomic check: a failed condition is proof that the entry did not
    /// match at that instant, and the entry is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert(1, 5).unwrap(), None);
    /// assert_eq!(hashmap.remove_if(&1, |v| *v == 6).unwrap(), None);
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), Some(5));
    /// assert_eq!(hashmap.remove_if(&1, |v| *v == 5).unwrap(), Some(5));
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), None);
    /// ```
    #[inline]
    pub fn remove_if<Q, F: FnOnce(&V) -> bool>(
        &self,
        key: &Q,
        condition: F,
    ) -> Result<Option<V>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash(key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        if let Some(index) = chain.position(key, hash) {
            if condition(&chain.entry(index).val) {
                let entry = chain.remove(index);
                drop(chain);
                self.num_entries.add(-1);
                return Ok(Some(entry.val));
            }
        }
        Ok(None)
    }

    /// Replaces the value associated with the key and returns the previous
    /// value, or returns `None` without inserting if the key is absent.
    ///
    /// The supplied value is dropped if the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    #[inline]
    pub fn replace<Q>(&self, key: &Q, val: V) -> Result<Option<V>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.replace_if(key, val, |_| true)
    }

    /// Replaces the value associated with the key if the condition holds for
    /// its current value, returning the replaced value.
    ///
    /// The condition is evaluated under the bucket lock, making the
    /// check-and-replace atomic. The supplied value is dropped if the key is
    /// absent or the condition fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert(1, 5).unwrap(), None);
    /// assert_eq!(hashmap.replace_if(&1, 7, |v| *v == 6).unwrap(), None);
    /// assert_eq!(hashmap.replace_if(&1, 7, |v| *v == 5).unwrap(), Some(5));
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), Some(7));
    /// ```
    #[inline]
    pub fn replace_if<Q, F: FnOnce(&V) -> bool>(
        &self,
        key: &Q,
        val: V,
        condition: F,
    ) -> Result<Option<V>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash(key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        if let Some(index) = chain.position(key, hash) {
            if condition(&chain.entry(index).val) {
                return Ok(Some(replace(&mut chain.entry_mut(index).val, val)));
            }
        }
        Ok(None)
    }

    /// Visits every entry in bucket index order.
    ///
    /// The traversal is weakly consistent: no map-wide lock is taken, every
    /// entry present for the whole traversal is visited at least once, and
    /// entries inserted or removed mid-traversal may be visited zero, one,
    /// or two times.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires; buckets visited before the failure have already been passed
    /// to the visitor.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert(1, 10).unwrap(), None);
    /// assert_eq!(hashmap.insert(2, 20).unwrap(), None);
    ///
    /// let mut total = 0;
    /// hashmap.for_each(|_, v| total += v).unwrap();
    /// assert_eq!(total, 30);
    /// ```
    #[inline]
    pub fn for_each<F: FnMut(&K, &V)>(&self, mut visitor: F) -> Result<(), Error> {
        let guard = Guard::new();
        let array = self.current_array(&guard);
        for index in 0..array.num_buckets() {
            self.walk_bucket(array, index, self.lock_wait_limit, &guard, &mut |k, v| {
                visitor(k, v);
                true
            })?;
        }
        Ok(())
    }

    /// Retains only the entries for which the predicate returns `true`,
    /// returning the number of removed entries.
    ///
    /// Subject to the same weak-consistency guarantees as
    /// [`HashMap::for_each`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires; buckets processed before the failure keep the outcome of the
    /// predicate.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// for k in 0..8 {
    ///     assert_eq!(hashmap.insert(k, k as u32).unwrap(), None);
    /// }
    /// assert_eq!(hashmap.retain(|k, _| k % 2 == 0).unwrap(), 4);
    /// assert_eq!(hashmap.len(), 4);
    /// ```
    pub fn retain<F: FnMut(&K, &mut V) -> bool>(&self, mut pred: F) -> Result<usize, Error> {
        let guard = Guard::new();
        let array = self.current_array(&guard);
        let mut removed = 0;
        for index in 0..array.num_buckets() {
            removed += self.retain_bucket(array, index, &guard, &mut pred)?;
        }
        #[allow(clippy::cast_possible_wrap)]
        if removed > 0 {
            self.num_entries.add(-(removed as isize));
        }
        Ok(removed)
    }

    /// Removes every entry, returning the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    #[inline]
    pub fn clear(&self) -> Result<usize, Error> {
        self.retain(|_, _| false)
    }

    /// Applies the predicate to every entry reachable from the bucket at
    /// `index`, dropping rejected entries.
    fn retain_bucket<F: FnMut(&K, &mut V) -> bool>(
        &self,
        array: &BucketArray<K, V>,
        index: usize,
        guard: &Guard,
        pred: &mut F,
    ) -> Result<usize, Error> {
        let mut chain = array.bucket(index).lock_with_limit(self.lock_wait_limit)?;
        if chain.is_forwarded() {
            drop(chain);
            // A forwarded chain always has a successor array installed.
            let next = unsafe { array.next_array(guard).as_ref().unwrap_unchecked() };
            let removed = self.retain_bucket(next, index, guard, pred)?;
            return Ok(removed + self.retain_bucket(next, index + array.num_buckets(), guard, pred)?);
        }
        Ok(chain.retain(|entry| pred(&entry.key, &mut entry.val)))
    }
}

impl<K: 'static + Eq + Hash, V: 'static + Clone, H: BuildHasher> HashMap<K, V, H> {
    /// Returns a clone of the value associated with the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Result<Option<V>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.read(key, |_, v| v.clone())
    }

    /// Inserts a key-value pair only if the key is absent, returning the
    /// already-present value otherwise.
    ///
    /// The check and the insertion are a single atomic step under the bucket
    /// lock; this is not decomposable into [`HashMap::contains`] followed by
    /// [`HashMap::insert`], which would race. The supplied pair is dropped
    /// if the key is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires, or [`Error::ResourceExhausted`] if a triggered growth
    /// attempt failed to allocate.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert_if_absent(1, 10).unwrap(), None);
    /// assert_eq!(hashmap.insert_if_absent(1, 11).unwrap(), Some(10));
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), Some(10));
    /// ```
    #[inline]
    pub fn insert_if_absent(&self, key: K, val: V) -> Result<Option<V>, Error> {
        let guard = Guard::new();
        let hash = self.hash(&key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        if let Some(index) = chain.position(&key, hash) {
            return Ok(Some(chain.entry(index).val.clone()));
        }
        chain.push(Entry { hash, key, val });
        drop(chain);
        self.num_entries.add(1);
        self.check_capacity(&guard)?;
        Ok(None)
    }

    /// Returns the value associated with the key, constructing and inserting
    /// it first if the key is absent.
    ///
    /// The constructor is invoked at most once per call, and only while the
    /// bucket lock is held with the key absent at that instant. When several
    /// threads race on the same absent key, exactly one constructor
    /// invocation takes effect and every caller observes that single value;
    /// the key is never inserted twice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires, or [`Error::ResourceExhausted`] if a triggered growth
    /// attempt failed to allocate.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.compute_if_absent(1, |_| 10).unwrap(), 10);
    /// assert_eq!(hashmap.compute_if_absent(1, |_| 11).unwrap(), 10);
    /// ```
    #[inline]
    pub fn compute_if_absent<F: FnOnce(&K) -> V>(
        &self,
        key: K,
        constructor: F,
    ) -> Result<V, Error> {
        let guard = Guard::new();
        let hash = self.hash(&key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        if let Some(index) = chain.position(&key, hash) {
            return Ok(chain.entry(index).val.clone());
        }
        let val = constructor(&key);
        let result = val.clone();
        chain.push(Entry { hash, key, val });
        drop(chain);
        self.num_entries.add(1);
        self.check_capacity(&guard)?;
        Ok(result)
    }

    /// Remaps the value associated with the key if the key is present.
    ///
    /// Returning `None` from the closure removes the entry; this is a
    /// documented signal, not an error. The returned value is the one left
    /// in the map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.compute_if_present(&1, |_, v| Some(v + 1)).unwrap(), None);
    /// assert_eq!(hashmap.insert(1, 0).unwrap(), None);
    /// assert_eq!(hashmap.compute_if_present(&1, |_, v| Some(v + 1)).unwrap(), Some(1));
    /// assert_eq!(hashmap.compute_if_present(&1, |_, _| None).unwrap(), None);
    /// assert_eq!(hashmap.read(&1, |_, v| *v).unwrap(), None);
    /// ```
    #[inline]
    pub fn compute_if_present<Q, F: FnOnce(&K, &V) -> Option<V>>(
        &self,
        key: &Q,
        remapper: F,
    ) -> Result<Option<V>, Error>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash(key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        let Some(index) = chain.position(key, hash) else {
            return Ok(None);
        };
        let replacement = {
            let entry = chain.entry(index);
            remapper(&entry.key, &entry.val)
        };
        match replacement {
            Some(val) => {
                let result = val.clone();
                chain.entry_mut(index).val = val;
                Ok(Some(result))
            }
            None => {
                drop(chain.remove(index));
                drop(chain);
                self.num_entries.add(-1);
                Ok(None)
            }
        }
    }

    /// Remaps the value associated with the key, whether present or absent.
    ///
    /// The closure receives the current value, or `None` if the key is
    /// absent, and its return value becomes the new state: `Some` inserts or
    /// replaces, `None` removes or leaves the key absent. The whole sequence
    /// is one atomic step under the bucket lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires, or [`Error::ResourceExhausted`] if a triggered growth
    /// attempt failed to allocate.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.compute(1, |_, v| Some(v.map_or(0, |v| v + 1))).unwrap(), Some(0));
    /// assert_eq!(hashmap.compute(1, |_, v| Some(v.map_or(0, |v| v + 1))).unwrap(), Some(1));
    /// assert_eq!(hashmap.compute(1, |_, _| None).unwrap(), None);
    /// assert!(!hashmap.contains(&1).unwrap());
    /// ```
    pub fn compute<F: FnOnce(&K, Option<&V>) -> Option<V>>(
        &self,
        key: K,
        remapper: F,
    ) -> Result<Option<V>, Error> {
        let guard = Guard::new();
        let hash = self.hash(&key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        match chain.position(&key, hash) {
            Some(index) => {
                let replacement = {
                    let entry = chain.entry(index);
                    remapper(&entry.key, Some(&entry.val))
                };
                match replacement {
                    Some(val) => {
                        let result = val.clone();
                        chain.entry_mut(index).val = val;
                        Ok(Some(result))
                    }
                    None => {
                        drop(chain.remove(index));
                        drop(chain);
                        self.num_entries.add(-1);
                        Ok(None)
                    }
                }
            }
            None => match remapper(&key, None) {
                Some(val) => {
                    let result = val.clone();
                    chain.push(Entry { hash, key, val });
                    drop(chain);
                    self.num_entries.add(1);
                    self.check_capacity(&guard)?;
                    Ok(Some(result))
                }
                None => Ok(None),
            },
        }
    }

    /// Merges a value into the entry associated with the key.
    ///
    /// If the key is absent, the supplied value is inserted as-is. If the
    /// key is present, the combiner receives the current value and the
    /// supplied one, and its return value becomes the new state: `Some`
    /// replaces, `None` removes. The returned value is the one left in the
    /// map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a lock wait limit is configured and
    /// expires, or [`Error::ResourceExhausted`] if a triggered growth
    /// attempt failed to allocate.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.merge(1, 1, |old, new| Some(old + new)).unwrap(), Some(1));
    /// assert_eq!(hashmap.merge(1, 1, |old, new| Some(old + new)).unwrap(), Some(2));
    /// assert_eq!(hashmap.merge(1, 1, |_, _| None).unwrap(), None);
    /// assert!(!hashmap.contains(&1).unwrap());
    /// ```
    pub fn merge<F: FnOnce(&V, V) -> Option<V>>(
        &self,
        key: K,
        val: V,
        combiner: F,
    ) -> Result<Option<V>, Error> {
        let guard = Guard::new();
        let hash = self.hash(&key);
        let mut chain = self.lock_chain(hash, self.lock_wait_limit, &guard)?;
        if let Some(index) = chain.position(&key, hash) {
            match combiner(&chain.entry(index).val, val) {
                Some(combined) => {
                    let result = combined.clone();
                    chain.entry_mut(index).val = combined;
                    Ok(Some(result))
                }
                None => {
                    drop(chain.remove(index));
                    drop(chain);
                    self.num_entries.add(-1);
                    Ok(None)
                }
            }
        } else {
            let result = val.clone();
            chain.push(Entry { hash, key, val });
            drop(chain);
            self.num_entries.add(1);
            self.check_capacity(&guard)?;
            Ok(Some(result))
        }
    }
}

impl<K: 'static + Clone, V: 'static + Clone, H: BuildHasher> HashMap<K, V, H> {
    /// Returns a weakly consistent iterator over the entries.
    ///
    /// The iterator is lazy and finite: each call to [`HashMap::iter`]
    /// starts an independent traversal from the first bucket. Entries are
    /// cloned one bucket at a time, so no lock is held between calls to
    /// [`Iterator::next`]. Bucket locks are acquired with an unbounded wait
    /// regardless of the configured lock wait limit.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert_eq!(hashmap.insert(1, 10).unwrap(), None);
    /// assert_eq!(hashmap.insert(2, 20).unwrap(), None);
    ///
    /// let mut pairs: Vec<(u64, u32)> = hashmap.iter().collect();
    /// pairs.sort_unstable();
    /// assert_eq!(pairs, [(1, 10), (2, 20)]);
    /// ```
    #[inline]
    pub fn iter(&self) -> Iter<K, V> {
        let guard = Guard::new();
        Iter {
            array: self.array.get_shared(Acquire, &guard),
            index: 0,
            pending: VecDeque::new(),
        }
    }
}

impl<K, V, H> Clone for HashMap<K, V, H>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
    H: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let cloned = Self::build(
            Options {
                initial_capacity: self.capacity(),
                load_factor: self.load_factor,
                lock_wait_limit: self.lock_wait_limit,
            },
            self.build_hasher.clone(),
        );
        self.all_entries(|k, v| {
            // The clone is not yet shared, hence lock waits cannot expire,
            // and it is pre-sized, hence growth is not triggered.
            cloned.insert(k.clone(), v.clone()).is_ok()
        });
        cloned
    }
}

impl<K, V, H> Debug for HashMap<K, V, H>
where
    K: 'static + Debug,
    V: 'static + Debug,
    H: BuildHasher,
{
    /// Formats the entries as a map.
    ///
    /// The traversal is weakly consistent, like [`HashMap::for_each`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.all_entries(|k, v| {
            map.entry(k, v);
            true
        });
        map.finish()
    }
}

impl<K, V, H> PartialEq for HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static + PartialEq,
    H: BuildHasher,
{
    /// Compares two maps entry by entry.
    ///
    /// Only meaningful when neither map is being mutated concurrently.
    fn eq(&self, other: &Self) -> bool {
        self.all_entries(|k, v| other.has_entry(k, v)) && other.all_entries(|k, v| self.has_entry(k, v))
    }
}

impl<K: 'static + Eq + Hash, V: 'static + PartialEq, H: BuildHasher> HashMap<K, V, H> {
    /// Returns `true` if the map contains the exact key-value pair.
    fn has_entry(&self, key: &K, val: &V) -> bool {
        let guard = Guard::new();
        let hash = self.hash(key);
        let Ok(chain) = self.lock_chain(hash, None, &guard) else {
            return false;
        };
        chain
            .position(key, hash)
            .is_some_and(|index| chain.entry(index).val == *val)
    }
}

impl<K: 'static + Clone, V: 'static + Clone> Iterator for Iter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if let Some(pair) = self.pending.pop_front() {
                return Some(pair);
            }
            let array = self.array.as_ref()?;
            if self.index == array.num_buckets() {
                return None;
            }
            Self::collect_bucket(array, self.index, &mut self.pending);
            self.index += 1;
        }
    }
}

impl<K: 'static + Clone, V: 'static + Clone> FusedIterator for Iter<K, V> {}

impl<K: 'static + Clone, V: 'static + Clone> Iter<K, V> {
    /// Clones every entry reachable from the bucket at `index` into the
    /// buffer, following forwarding into the successor array.
    fn collect_bucket(array: &BucketArray<K, V>, index: usize, out: &mut VecDeque<(K, V)>) {
        let chain = array.bucket(index).lock();
        if chain.is_forwarded() {
            drop(chain);
            let guard = Guard::new();
            if let Some(next) = array.next_array(&guard).as_ref() {
                Self::collect_bucket(next, index, out);
                Self::collect_bucket(next, index + array.num_buckets(), out);
            }
            return;
        }
        for entry in chain.iter() {
            out.push_back((entry.key.clone(), entry.val.clone()));
        }
    }
}
