//! A non-blocking hash map.
//!
//! This crate implements a completely lock-free (no mutexes, no spin-locks,
//! or the alike) hash map, mapping keys the map owns onto opaque values the
//! caller owns. Any number of threads may read, insert, update and delete
//! mappings concurrently; readers and writers proceed in parallel, and the
//! table grows behind the scenes when probing gets too expensive.
//!
//! The only synchronization instruction used is CAS. There are a few spots
//! where a thread waits for something another thread has promised to do in a
//! bounded number of its own instructions (publishing a hash, promoting a new
//! table); those waits back off and give up the time slice rather than block.
//!
//! # Design
//!
//! The map is open-addressed with linear reprobing. Each slot holds a key, a
//! memoized hash and a value in three independently atomic words, read and
//! written in that strict order. Keys are write-once per table, so a reader
//! that found a key can trust it for the table's whole lifetime; the value
//! word is the single contention point every update CASes.
//!
//! When a writer exhausts its probe bound, the table is migrated to a new
//! generation. The migration is cooperative: one thread wins the right to
//! allocate the successor, and every thread that stumbles over it helps
//! initialize and copy fixed-size blocks of slots until the work is drained.
//! Slots of the retiring table are sealed with a marker as they are carried
//! over, so latecomers know to retry on the successor.
//!
//! # Keys and values
//!
//! The map owns its keys: `put_if` takes the key by `Box` and the map
//! disposes of it exactly once, whether it ends up stored, turns out to be a
//! duplicate, or is deleted. What the map needs from the key type — hashing
//! and equality — comes from the [`Key`] trait.
//!
//! Values are opaque, word-sized and caller-owned: the map stores raw
//! `*const V` pointers, never dereferences them and never frees them. A null
//! value means "no mapping"; deleting is just updating to null. Conditional
//! updates compare values by pointer identity.
//!
//! # Memory reclamation
//!
//! Retired tables are kept on a chain and freed a grace period (30 seconds)
//! after leaving service, because other threads may still be probing them.
//! Keys deleted during a migration are buried in the retiring table rather
//! than freed on the spot — late readers may still be comparing against
//! them — and go with their table when it is reclaimed. The grace is
//! wall-clock, not reference-counted: a thread suspended for longer than the
//! grace while holding a table reference can touch a freed table, or hand a
//! freed key to [`Key::equals`]; see the trait docs for the contract this
//! puts on implementations. The window is narrow, bounded and accepted by
//! design — this structure trades a sliver of reclamation safety for never
//! taking a lock.

#![deny(missing_docs)]

#[cfg(test)]
mod tests;

mod debug;
mod resize;
mod table;

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use crate::table::{Probe, Table, Update};

/// The initial (and minimum) table length.
const INITIAL_SIZE: usize = 4;

/// The capabilities the map needs from its key type.
///
/// Implementations must be consistent: equal keys hash alike, and both
/// functions are deterministic. Hash quality directly buys probe length; a
/// weak hash clusters the table and forces needless growth.
///
/// # Robustness
///
/// `equals` may be invoked with `self` being a key the map has already
/// disposed of. Keys deleted during a migration stay allocated until their
/// table's reclamation grace runs out, so hitting this takes a reader
/// suspended for longer than the grace in the middle of a probe — the same
/// window in which a retired table itself can be freed under a sleeping
/// reader. The comparison's result is discarded in that case — the reader
/// will find the slot sealed and retry — but the call still happens. An
/// implementation must therefore be prepared to run to completion on stale
/// `self` contents, and must not follow owned pointers that deallocation
/// invalidates if keys can be deleted while other threads read. Keeping the
/// compared state inline in the key type keeps the race benign.
pub trait Key {
    /// Hash the key.
    ///
    /// A result of 0 is fine; it is remapped internally (0 marks a slot whose
    /// hash is not yet published).
    fn hash(&self) -> u32;

    /// Compare two keys for equality.
    ///
    /// `self` is the stored key — possibly stale, see the trait docs — and
    /// `other` is the probe.
    fn equals(&self, other: &Self) -> bool;
}

/// The expectation a conditional update is checked against.
#[derive(Debug)]
pub enum Expected<V> {
    /// Any current value is acceptable; the update always proceeds.
    Any,
    /// The update only proceeds if the current value is pointer-identical to
    /// the given one. `Is(null)` means "only if the mapping is absent".
    Is(*const V),
}

// Not derived: deriving would put a needless `V: Copy` bound on these.
impl<V> Clone for Expected<V> {
    fn clone(&self) -> Expected<V> {
        *self
    }
}

impl<V> Copy for Expected<V> {}

impl<V> Expected<V> {
    /// Does an absent mapping satisfy the expectation?
    pub(crate) fn admits_absent(&self) -> bool {
        match *self {
            Expected::Any => true,
            Expected::Is(want) => want.is_null(),
        }
    }
}

/// A lock-free, concurrent hash map.
///
/// See the crate docs for the design and the ownership rules. A `HashMap` is
/// shared by reference (typically behind an `Arc`); all operations take
/// `&self`.
pub struct HashMap<K, V> {
    /// The current table.
    kvs: AtomicPtr<Table<K, V>>,
    /// The successor table while a migration is in flight: null when idle, a
    /// promise marker while the winner allocates, then the real table.
    nkvs: AtomicPtr<Table<K, V>>,
    /// The live mapping count. Signed: after heavy delete/insert churn it can
    /// transiently dip below zero while updates are still in flight.
    size: AtomicIsize,
    /// Mutations since the last migration; feeds the compaction heuristic.
    changes: AtomicUsize,
    /// The map owns boxed keys behind the table pointers.
    _keys: PhantomData<Box<K>>,
}

unsafe impl<K: Send, V> Send for HashMap<K, V> {}
unsafe impl<K: Send + Sync, V> Sync for HashMap<K, V> {}

impl<K: Key, V> HashMap<K, V> {
    /// Create an empty map.
    pub fn new() -> HashMap<K, V> {
        HashMap {
            kvs: AtomicPtr::new(Table::alloc_zeroed(INITIAL_SIZE)),
            nkvs: AtomicPtr::new(ptr::null_mut()),
            size: AtomicIsize::new(0),
            changes: AtomicUsize::new(0),
            _keys: PhantomData,
        }
    }

    /// Get the value `key` currently maps to.
    ///
    /// Null means no mapping. The returned pointer is whatever some `put_if`
    /// stored; the map makes no claim about what it points to — that contract
    /// is between the inserting and the reading caller.
    pub fn get(&self, key: &K) -> *const V {
        let hash = nonzero_hash(key.hash());

        let mut kvs = self.kvs.load(Ordering::Acquire);
        loop {
            // The table pointer is valid: tables outlive their service life
            // by the reclamation grace, and we just loaded this one.
            match unsafe { (*kvs).lookup(key, hash) } {
                Probe::Value(val) => return val,
                Probe::Moved => {
                    // Help the migration finish, then ask the new table.
                    unsafe { self.help_resize(kvs) };
                    kvs = self.kvs.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Update the mapping for `key`, conditionally.
    ///
    /// The map takes ownership of `key` and disposes of it exactly once. A
    /// null `val` deletes the mapping (a mapping to null and no mapping are
    /// indistinguishable). The update only happens if the current value
    /// satisfies `expected`; pass [`Expected::Any`] to update
    /// unconditionally.
    ///
    /// Returns the value mapped just before the update — null for none. If a
    /// conditional expectation failed, nothing was written and the returned
    /// (non-matching) current value is how the caller tells.
    pub fn put_if(&self, key: Box<K>, val: *const V, expected: Expected<V>) -> *const V {
        let hash = nonzero_hash(key.hash());
        let key = Box::into_raw(key);

        let mut kvs = self.kvs.load(Ordering::Acquire);
        loop {
            match unsafe { (*kvs).update(self, key, hash, val, expected, false) } {
                Update::Prior(prior) => return prior,
                Update::Moved => {
                    // Help the migration finish, then rerun on the new table.
                    // The key is still ours to reuse.
                    unsafe { self.help_resize(kvs) };
                    kvs = self.kvs.load(Ordering::Acquire);
                }
                // Tombstones only surface inside the copy protocol.
                Update::Tombstone => unreachable!(),
            }
        }
    }

    /// Insert or overwrite the mapping for `key`.
    ///
    /// Shorthand for an unconditional [`put_if`](HashMap::put_if). Returns
    /// the previously mapped value, null for none.
    pub fn insert(&self, key: Box<K>, val: *const V) -> *const V {
        self.put_if(key, val, Expected::Any)
    }

    /// Delete the mapping for `key`.
    ///
    /// Shorthand for an unconditional [`put_if`](HashMap::put_if) to null.
    /// The map takes ownership of (and disposes) `key` here too. Returns the
    /// previously mapped value, null for none.
    pub fn remove(&self, key: Box<K>) -> *const V {
        self.put_if(key, ptr::null(), Expected::Any)
    }

    /// The number of live mappings.
    ///
    /// The underlying counter is updated after the fact and can transiently
    /// dip below zero under churn; this clamps such readings to 0. Between
    /// quiescent points the count is exact.
    pub fn len(&self) -> usize {
        let size = self.size.load(Ordering::Relaxed);
        if size < 0 {
            0
        } else {
            size as usize
        }
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current table length in slots.
    ///
    /// Useful for eyeballing the fill ratio together with
    /// [`len`](HashMap::len); the footprint is roughly three words per slot.
    pub fn capacity(&self) -> usize {
        unsafe { (*self.kvs.load(Ordering::Acquire)).len }
    }
}

impl<K: Key, V> Default for HashMap<K, V> {
    fn default() -> HashMap<K, V> {
        HashMap::new()
    }
}

impl<K, V> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        // `&mut self` means no operation is in flight anywhere, and any
        // migration has long finished, so the plain walk below is safe.
        let kvs = *self.kvs.get_mut();
        debug_assert!(self.nkvs.get_mut().is_null());

        unsafe {
            // Retired generations hold no keys of their own anymore; the
            // chain goes as-is, grace or no grace.
            let mut old = (*kvs).prev.load(Ordering::Relaxed);
            while !old.is_null() {
                let older = (*old).prev.load(Ordering::Relaxed);
                drop(Box::from_raw(old));
                old = older;
            }

            // The current table still owns its keys.
            for i in 0..(*kvs).len {
                let k = (*kvs).slot(i).key.load(Ordering::Relaxed);
                debug_assert!(k != table::moved());
                if !k.is_null() {
                    drop(Box::from_raw(k));
                }
            }
            drop(Box::from_raw(kvs));
        }
    }
}

/// Remap a user hash of 0 to 1; 0 is reserved for "not yet published".
fn nonzero_hash(hash: u32) -> u32 {
    if hash == 0 {
        1
    } else {
        hash
    }
}
