//! Int62Set: a concurrent unordered set for 62-bit unsigned integers, built on
//! per-bucket atomic slot arrays with in-slot access-control bits.
//!
//! The set accepts every value in `[0, 1 << 62)`. The two remaining bits of a
//! 64-bit slot word carry access-control state, which is what lets membership
//! changes publish and retract with a single CAS: no boxing, no per-element
//! allocation, no side-band validity table.
//!
//! # Concurrency
//!
//! [`Int62Set::add`], [`Int62Set::remove`] and [`Int62Set::contains`] are the
//! atomic primitives; everything else (bulk helpers, the iterator) is layered
//! on top of them and is *not* atomic as a whole. `add` and `remove` are
//! lock-minimal rather than lock-free: while a bucket doubles its slot array,
//! workers on that bucket spin-yield until the swap completes, and the grower
//! in turn waits for the workers it observed to drain. `contains` never
//! blocks.
//!
//! The number of buckets is fixed at construction and must be a power of two.
//! Each bucket's slot array starts at 16 entries and doubles under load;
//! arrays never shrink. Replaced arrays are retired, not freed, so lookups
//! and iterators that still reference them stay valid; the memory is
//! reclaimed when the set is dropped.
//!
//! # Value distribution
//!
//! The bucket for a value is `((v & 0xFFFF_FFFF) ^ (v >> 32)) & (buckets - 1)`
//! computed on the biased value. Values whose low bits are sparse (aligned
//! pointers, multiples of 8, ...) will cluster; pre-mix such values before
//! inserting them or the per-bucket linear scans degrade.
//!
//! # Iteration
//!
//! Multiple iterators may run at once and the set may be mutated while they
//! run. Iterators are not snapshots: a removal between [`Iter::has_next`] and
//! [`Iter::try_next`] can exhaust the cursor, and values inserted behind the
//! cursor may or may not be observed. The guarantees are that a single
//! iterator never returns the same slot twice and that every returned value
//! was a member when its slot array was current; after [`Int62Set::clear`] an
//! in-flight iterator may still drain values from the array it had pinned.
//!
//! # Non-features
//!
//! `Int62Set` does not implement `PartialEq`/`Hash` against other sets, does
//! not support snapshot iteration, and never rehashes: bucket membership is a
//! pure function of the value, independent of array length.

use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Slot flag marking a published, readable value (bit 63).
const CTRL_BIT_READ: u64 = 1 << 63;

/// Low 32 bits, folded against the high bits by the bucket hash.
const INT_32_BITS: u64 = 0xFFFF_FFFF;

/// Everything except the READ flag: the biased value bits of a slot word.
const INT_63_BITS: u64 = !CTRL_BIT_READ;

/// The accepted input domain: 62 bits.
const INT_62_BITS: u64 = INT_63_BITS & !(1 << 62);

/// Slot array length on first use. Growth doubles from here.
const INITIAL_SLOTS: usize = 16;

// ================================================================================================
// ERRORS
// ================================================================================================

/// Errors surfaced by [`Int62Set`] and its iterator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Construction was attempted with a bucket count that is zero or not a
    /// power of two.
    #[error("bucket count must be a positive power of two, got {0}")]
    InvalidBucketCount(usize),
    /// The value passed to [`Int62Set::add`] or [`Int62Set::remove`] does not
    /// fit in 62 bits.
    #[error("value {0} is not a 62-bit unsigned integer")]
    ValueOutOfRange(u64),
    /// [`Iter::try_next`] was called with no further elements. Under
    /// concurrent removal this can happen even right after
    /// [`Iter::has_next`] returned `true`.
    #[error("iterator exhausted")]
    Exhausted,
    /// [`Iter::remove`] was called before any element was returned.
    #[error("try_next() has not returned an element")]
    NoCurrentElement,
    /// [`Iter::remove`] found the element already gone, i.e. another thread
    /// removed it after the iterator returned it.
    #[error("element already removed")]
    AlreadyRemoved,
}

// ================================================================================================
// SLOT ARRAY
// ================================================================================================

/// A flat array of atomic slot words.
///
/// Word states: `0` is an empty slot; a biased value with READ clear is a
/// reservation owned by exactly one in-flight `add`; a biased value with READ
/// set is a published member. Bias is +1 so that a stored zero always means
/// "empty".
struct SlotArray {
    words: Box<[AtomicU64]>,
}

impl SlotArray {
    fn boxed(len: usize) -> Box<SlotArray> {
        Box::new(SlotArray {
            words: (0..len).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.words.len()
    }

    #[inline(always)]
    fn load(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Acquire)
    }
}

// ================================================================================================
// BUCKET
// ================================================================================================

/// One hash shard of the set.
///
/// `ctrl` coordinates workers against growth: non-negative values count the
/// active readers/writers on `slots`; a grower flips the counter to
/// `-(workers + 1)` in one CAS and waits for the releases to bring it to the
/// quiesce sentinel `-1`. `size` is a load proxy only; it may transiently
/// over- or under-count under contention.
struct Bucket {
    ctrl: AtomicI32,
    slots: AtomicPtr<SlotArray>,
    size: AtomicI32,
    /// Serializes growth and clearing; owns the arrays this bucket has
    /// replaced. Retiring instead of freeing keeps outstanding snapshots
    /// (contains scans, iterators) valid for the lifetime of the set.
    retired: Mutex<Vec<Box<SlotArray>>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            ctrl: AtomicI32::new(0),
            slots: AtomicPtr::new(std::ptr::null_mut()),
            size: AtomicI32::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot the current slot array.
    ///
    /// SAFETY: slot arrays are only deallocated by `Drop for Bucket` (current
    /// pointer and retired list alike), so any pointer observed here stays
    /// valid at least as long as the borrow of `self`.
    #[inline(always)]
    fn slot_snapshot(&self) -> Option<&SlotArray> {
        let ptr = self.slots.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    // --------------------------------------------------------------------------------------------
    // ctrl protocol
    // --------------------------------------------------------------------------------------------

    /// Enter the bucket as one of many readers/writers.
    #[inline(always)]
    fn acquire_shared(&self) {
        loop {
            let ctrl = self.ctrl.load(Ordering::Acquire);
            if ctrl < 0 {
                thread::yield_now();
                continue;
            }
            if self
                .ctrl
                .compare_exchange_weak(ctrl, ctrl + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Leave the bucket. While a grower holds the counter negated, each
    /// release steps the value toward the `-1` quiesce sentinel.
    #[inline(always)]
    fn release_shared(&self) {
        loop {
            let ctrl = self.ctrl.load(Ordering::Acquire);
            let next = if ctrl < 0 { ctrl + 1 } else { ctrl - 1 };
            if self
                .ctrl
                .compare_exchange_weak(ctrl, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Claim the bucket exclusively: negate-and-bump the worker count in a
    /// single CAS, then wait for the observed workers to drain.
    fn acquire_exclusive(&self) {
        loop {
            let ctrl = self.ctrl.load(Ordering::Acquire);
            if self
                .ctrl
                .compare_exchange_weak(ctrl, -ctrl - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        // -1 is the exact quiesce sentinel; any value below it means workers
        // are still draining, so the comparison must not be relaxed to `< 0`.
        while self.ctrl.load(Ordering::Acquire) != -1 {
            thread::yield_now();
        }
    }

    #[inline(always)]
    fn release_exclusive(&self) {
        self.ctrl.fetch_add(1, Ordering::Release);
    }

    // --------------------------------------------------------------------------------------------
    // core operations (all take the biased value)
    // --------------------------------------------------------------------------------------------

    /// Membership probe against a slot-array snapshot. Takes no lock at all:
    /// the snapshot stays readable across growth, and missing a concurrent
    /// insert or observing a concurrent remove are both inside the contract.
    fn contains(&self, element: u64) -> bool {
        let Some(slots) = self.slot_snapshot() else {
            return false;
        };
        let published = element | CTRL_BIT_READ;
        let mut index = slots.len();
        while index != 0 {
            index -= 1;
            if slots.load(index) == published {
                return true;
            }
        }
        false
    }

    /// Insert the biased value. Returns `true` iff it was newly inserted.
    ///
    /// Two-phase: reserve an empty slot by CAS-ing the raw value in with READ
    /// clear, finish the duplicate scan, then publish by setting READ. A
    /// reserved slot is invisible to `contains` and to other adders'
    /// empty-slot CAS, which is what keeps two concurrent adds of the same
    /// value from both succeeding.
    fn add(&self, element: u64) -> bool {
        loop {
            self.acquire_shared();
            let witness = self.slots.load(Ordering::Acquire);
            if witness.is_null() {
                self.release_shared();
                self.grow(witness);
                continue;
            }
            // SAFETY: see `slot_snapshot`; arrays are retired, never freed,
            // while the bucket is alive.
            let slots = unsafe { &*witness };

            let occupancy = self.size.fetch_add(1, Ordering::AcqRel) + 1;
            if occupancy >= slots.len() as i32 {
                // The size proxy is only ever touched while shared access is
                // held; a clear that quiesces this bucket must not race a
                // straggling decrement.
                self.size.fetch_sub(1, Ordering::AcqRel);
                self.release_shared();
                self.grow(witness);
                continue;
            }

            let mut store_index: Option<usize> = None;
            let mut index = slots.len();
            while index != 0 {
                index -= 1;
                if store_index.is_none()
                    && slots.words[index]
                        .compare_exchange(0, element, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    store_index = Some(index);
                } else if slots.load(index) & INT_63_BITS == element {
                    // Already present (reserved or published elsewhere).
                    // Roll back our reservation if we made one.
                    if let Some(reserved) = store_index {
                        slots.words[reserved].store(0, Ordering::Release);
                    }
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    self.release_shared();
                    return false;
                }
            }

            if let Some(reserved) = store_index {
                if slots.words[reserved]
                    .compare_exchange(
                        element,
                        element | CTRL_BIT_READ,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    // No other thread may touch a reserved slot; a failed
                    // publish means the protocol was violated somewhere.
                    unreachable!("reserved slot mutated before publish");
                }
                self.release_shared();
                return true;
            }

            // Every slot held some other value: the size proxy under-counted
            // the real load. Retry; the next pass trips the growth check.
            self.size.fetch_sub(1, Ordering::AcqRel);
            self.release_shared();
        }
    }

    /// Remove the biased value, whether it is published or still reserved.
    /// Returns `true` iff a slot was cleared.
    fn remove(&self, element: u64) -> bool {
        self.acquire_shared();
        let Some(slots) = self.slot_snapshot() else {
            self.release_shared();
            return false;
        };

        let mut index = slots.len();
        while index != 0 {
            index -= 1;
            let word = slots.load(index);
            if word & INT_63_BITS != element {
                continue;
            }
            if slots.words[index]
                .compare_exchange(word, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The word changed under us; inspect the same slot again.
                index += 1;
                continue;
            }
            self.size.fetch_sub(1, Ordering::AcqRel);
            self.release_shared();
            return true;
        }

        self.release_shared();
        false
    }

    /// Grow the slot array the caller observed as `witness`.
    ///
    /// First allocation needs no exclusion beyond the serializing mutex (no
    /// reader can be traversing a null array). A real doubling quiesces the
    /// bucket, copies every word into the *upper* half of the new array, and
    /// publishes. Upper-half placement keeps the high-to-low scans probing
    /// old content at the same relative positions while fresh inserts land in
    /// the empty lower half; values never move between buckets, so nothing is
    /// rehashed.
    fn grow(&self, witness: *mut SlotArray) {
        let mut retired = self.retired.lock();
        if self.slots.load(Ordering::Acquire) != witness {
            // Another grower already advanced this bucket.
            return;
        }
        if witness.is_null() {
            let fresh = Box::into_raw(SlotArray::boxed(INITIAL_SLOTS));
            self.slots.store(fresh, Ordering::Release);
            return;
        }

        self.acquire_exclusive();

        // SAFETY: `witness` is the current array; we hold the growth mutex
        // and exclusive ctrl, so nobody else can retire or replace it.
        let old = unsafe { &*witness };
        let len = old.len();
        let grown = SlotArray::boxed(len << 1);
        for index in 0..len {
            grown.words[index + len].store(old.load(index), Ordering::Relaxed);
        }
        self.slots.store(Box::into_raw(grown), Ordering::Release);
        // SAFETY: the pointer was created by `Box::into_raw` and was just
        // unlinked from `slots`; the retired list now owns it.
        retired.push(unsafe { Box::from_raw(witness) });

        self.release_exclusive();
    }

    /// Drop this bucket's contents in place: quiesce, retire the current
    /// array, and reset the size proxy. Iterators still scanning the retired
    /// array keep reading whatever it held.
    fn clear(&self) {
        let mut retired = self.retired.lock();
        let current = self.slots.load(Ordering::Acquire);
        if current.is_null() {
            return;
        }

        self.acquire_exclusive();
        self.slots.store(std::ptr::null_mut(), Ordering::Release);
        self.size.store(0, Ordering::Release);
        // SAFETY: as in `grow`; ownership moves to the retired list.
        retired.push(unsafe { Box::from_raw(current) });
        self.release_exclusive();
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        let current = *self.slots.get_mut();
        if !current.is_null() {
            // SAFETY: created by Box::into_raw, never freed elsewhere.
            drop(unsafe { Box::from_raw(current) });
        }
        // The retired list drops its boxes on its own.
    }
}

// ================================================================================================
// SET
// ================================================================================================

/// A concurrent set of unsigned integers in `[0, 1 << 62)`.
///
/// See the crate-level documentation for the concurrency and iteration
/// contract.
pub struct Int62Set {
    buckets: Box<[Bucket]>,
}

impl Int62Set {
    /// Create a set with a fixed number of hash buckets.
    ///
    /// `bucket_count` must be a positive power of two and cannot be changed
    /// later. More buckets mean less contention and shorter per-bucket scans
    /// at the cost of memory; too few buckets for the element count degrades
    /// every operation linearly.
    pub fn with_buckets(bucket_count: usize) -> Result<Self, Error> {
        if bucket_count == 0 || !bucket_count.is_power_of_two() {
            return Err(Error::InvalidBucketCount(bucket_count));
        }
        Ok(Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
        })
    }

    /// Insert a value. Returns `Ok(true)` iff the value was not yet present.
    pub fn add(&self, element: u64) -> Result<bool, Error> {
        if element & !INT_62_BITS != 0 {
            return Err(Error::ValueOutOfRange(element));
        }
        let biased = element + 1;
        Ok(self.bucket_for(biased).add(biased))
    }

    /// Remove a value. Returns `Ok(true)` iff the value was present.
    pub fn remove(&self, element: u64) -> Result<bool, Error> {
        if element & !INT_62_BITS != 0 {
            return Err(Error::ValueOutOfRange(element));
        }
        let biased = element + 1;
        Ok(self.bucket_for(biased).remove(biased))
    }

    /// Membership test. Never blocks.
    ///
    /// Unlike [`add`](Self::add) and [`remove`](Self::remove) this does not
    /// validate the 62-bit domain: an out-of-range value is simply reported
    /// as absent.
    pub fn contains(&self, element: u64) -> bool {
        let biased = element.wrapping_add(1);
        self.bucket_for(biased).contains(biased)
    }

    /// Number of elements, summed from per-bucket counters.
    ///
    /// Approximate while mutations are in flight; exact when quiescent.
    /// Callers needing an exact count under concurrency must synchronize
    /// externally.
    pub fn len(&self) -> usize {
        let total: i64 = self
            .buckets
            .iter()
            .map(|bucket| bucket.size.load(Ordering::Relaxed) as i64)
            .sum();
        total.max(0) as usize
    }

    /// Best-effort emptiness check; same caveats as [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every element.
    ///
    /// Buckets are cleared one at a time; the operation is not atomic across
    /// buckets and an iterator in progress may observe a mixture of cleared
    /// and uncleared buckets.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
    }

    /// A cursor over the live set. Multiple iterators may coexist.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            buckets: &self.buckets,
            bucket_index: None,
            slot_index: 0,
            current: None,
            last: None,
        }
    }

    // --------------------------------------------------------------------------------------------
    // bulk helpers, all built on the atomic primitives above
    // --------------------------------------------------------------------------------------------

    /// Insert every value. Returns `Ok(true)` iff at least one insertion
    /// modified the set. Stops at the first out-of-range value.
    pub fn add_all<I: IntoIterator<Item = u64>>(&self, values: I) -> Result<bool, Error> {
        let mut modified = false;
        for value in values {
            modified |= self.add(value)?;
        }
        Ok(modified)
    }

    /// Remove every value. Returns `Ok(true)` iff at least one removal
    /// modified the set. Stops at the first out-of-range value.
    pub fn remove_all<I: IntoIterator<Item = u64>>(&self, values: I) -> Result<bool, Error> {
        let mut modified = false;
        for value in values {
            modified |= self.remove(value)?;
        }
        Ok(modified)
    }

    /// `true` iff every value is currently a member. Not atomic as a whole.
    pub fn contains_all<I: IntoIterator<Item = u64>>(&self, values: I) -> bool {
        values.into_iter().all(|value| self.contains(value))
    }

    /// Keep only the values the predicate accepts.
    ///
    /// Walks a live iterator; values inserted concurrently may or may not be
    /// visited, and a value the predicate rejects that another thread removes
    /// first is skipped silently.
    pub fn retain<F: FnMut(u64) -> bool>(&self, mut keep: F) {
        let mut iter = self.iter();
        while iter.has_next() {
            let Ok(value) = iter.try_next() else {
                break;
            };
            if !keep(value) {
                let _ = iter.remove();
            }
        }
    }

    /// Drain a live iterator into a `Vec`. Not a snapshot.
    pub fn to_vec(&self) -> Vec<u64> {
        self.iter().collect()
    }

    #[inline(always)]
    fn bucket_for(&self, biased: u64) -> &Bucket {
        &self.buckets[index_for(biased, self.buckets.len())]
    }
}

impl<'a> IntoIterator for &'a Int62Set {
    type Item = u64;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Bucket selection: fold the upper 32 bits onto the lower ones and mask.
///
/// Deliberately cheap and deliberately weak; callers storing values with
/// sparse low bits are expected to pre-mix them. The exact formula is part of
/// the contract (it fixes which bucket every value lives in), so it must not
/// be "improved".
#[inline(always)]
fn index_for(element: u64, bucket_count: usize) -> usize {
    (((element & INT_32_BITS) ^ (element >> 32)) as usize) & (bucket_count - 1)
}

// ================================================================================================
// ITERATOR
// ================================================================================================

/// A stateful cursor over an [`Int62Set`].
///
/// The cursor walks buckets in index order and slots from low to high,
/// pinning one slot array at a time: if the bucket grows mid-traversal the
/// cursor finishes the array it captured (possibly missing values placed in
/// the replacement's lower half) and picks up new arrays from the next bucket
/// onward. No locks are taken.
///
/// Besides the explicit [`has_next`](Iter::has_next) /
/// [`try_next`](Iter::try_next) / [`remove`](Iter::remove) surface, `Iter`
/// implements [`Iterator`] with exhaustion mapped to `None`.
pub struct Iter<'a> {
    buckets: &'a [Bucket],
    /// `None` until the first advance, then the bucket the cursor is in.
    bucket_index: Option<usize>,
    slot_index: usize,
    current: Option<&'a SlotArray>,
    /// Bucket index and biased value of the last returned element; consumed
    /// by [`Iter::remove`].
    last: Option<(usize, u64)>,
}

impl<'a> Iter<'a> {
    /// Advance the cursor to the next published slot, if any.
    ///
    /// Returns `false` once no buckets remain. A `true` result is only a
    /// hint under concurrent removal: the slot can be emptied before
    /// [`try_next`](Iter::try_next) reads it.
    pub fn has_next(&mut self) -> bool {
        let mut index = match self.bucket_index {
            Some(index) => index,
            None => {
                self.bucket_index = Some(0);
                self.current = self.buckets[0].slot_snapshot();
                0
            }
        };

        loop {
            if index >= self.buckets.len() {
                return false;
            }
            let Some(slots) = self.current else {
                // Bucket never allocated: nothing further to traverse.
                return false;
            };
            if slots.load(self.slot_index) & CTRL_BIT_READ != 0 {
                return true;
            }
            self.slot_index += 1;
            if self.slot_index == slots.len() {
                self.slot_index = 0;
                index += 1;
                self.bucket_index = Some(index);
                self.current = if index < self.buckets.len() {
                    self.buckets[index].slot_snapshot()
                } else {
                    None
                };
            }
        }
    }

    /// Return the next value, advancing the cursor past it.
    ///
    /// Fails with [`Error::Exhausted`] when no further element exists.
    /// Under concurrent removal this can happen even directly after
    /// [`has_next`](Iter::has_next) reported `true`.
    pub fn try_next(&mut self) -> Result<u64, Error> {
        loop {
            if !self.has_next() {
                return Err(Error::Exhausted);
            }
            let (index, slots) = match (self.bucket_index, self.current) {
                (Some(index), Some(slots)) => (index, slots),
                _ => return Err(Error::Exhausted),
            };

            let word = slots.load(self.slot_index);
            if word & CTRL_BIT_READ == 0 {
                // Lost a race with a remover; rescan from here.
                continue;
            }

            let biased = word & INT_63_BITS;
            self.last = Some((index, biased));

            self.slot_index += 1;
            if self.slot_index == slots.len() {
                self.slot_index = 0;
                let next = index + 1;
                self.bucket_index = Some(next);
                self.current = if next < self.buckets.len() {
                    self.buckets[next].slot_snapshot()
                } else {
                    None
                };
            }

            return Ok(biased - 1);
        }
    }

    /// Remove the element most recently returned by
    /// [`try_next`](Iter::try_next).
    ///
    /// Fails with [`Error::NoCurrentElement`] if there is no such element
    /// (nothing returned yet, or it was already consumed by a previous
    /// `remove`), and with [`Error::AlreadyRemoved`] if another thread
    /// removed the element first.
    pub fn remove(&mut self) -> Result<(), Error> {
        let Some((bucket, biased)) = self.last else {
            return Err(Error::NoCurrentElement);
        };
        if !self.buckets[bucket].remove(biased) {
            return Err(Error::AlreadyRemoved);
        }
        self.last = None;
        Ok(())
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.try_next().ok()
    }
}
