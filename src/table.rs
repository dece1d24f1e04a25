//! Tables and their slots.
//!
//! A table is one generation of the backing array. Every slot is a triple of
//! independently atomic fields which are read and written in key, hash, value
//! order, giving each slot a small state machine:
//!
//! | key    | hash | value  | state                                          |
//! |--------|------|--------|------------------------------------------------|
//! | null   | —    | —      | free                                           |
//! | k      | 0    | —      | claimed; the hash is about to be published     |
//! | k      | h    | v/null | live mapping (null value means deleted)        |
//! | moved  | —    | —      | migrated while free; consult the successor     |
//! | k      | h    | moved  | migrated while live; consult the successor     |
//! | k      | h    | tomb   | migrated while deleted; key buried here        |
//!
//! Keys are write-once per table: once a slot holds a key, only the value
//! changes. That is what lets readers trust a memoized hash and probe without
//! any lock. The moved and buried states are terminal; they appear only while
//! a table is being retired by the migration in `resize`. A buried key stays
//! allocated — late readers may still be comparing against it, and the writer
//! that claimed the slot may still pull it back out — and is freed together
//! with its table.

use std::alloc;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::resize;
use crate::{Expected, HashMap, Key};

/// The number of linear probes a writer attempts before growing the table.
///
/// A chain this long means the table is either too full or too clustered to
/// be worth probing further; the writer trades the probe loop for a new
/// generation instead.
pub(crate) const REPROBE_LIMIT: usize = 17;

// The marker addresses below are never dereferenced; they are compared by
// identity, like null, and cannot collide with real allocations.
static MOVED: u8 = 0;
static PROMISE: u8 = 1;
static TOMB: u8 = 2;

/// The in-slot marker meaning "this table is being migrated; read the
/// successor instead".
pub(crate) fn moved<T>() -> *mut T {
    &MOVED as *const u8 as *mut T
}

/// The next-table marker a migration winner publishes while it allocates,
/// claiming the right to produce the successor without making anyone wait on
/// it.
pub(crate) fn promise<T>() -> *mut T {
    &PROMISE as *const u8 as *mut T
}

/// The value marker for a slot whose key mapped to nothing when the table was
/// migrated. The key stays in the slot, buried, until the table is reclaimed.
pub(crate) fn tombstone<T>() -> *mut T {
    &TOMB as *const u8 as *mut T
}

/// Is this value word one of the migration seals?
fn is_sealed<T>(v: *mut T) -> bool {
    v == moved() || v == tombstone()
}

/// What a single-table lookup resolved to.
pub(crate) enum Probe<V> {
    /// The current mapping; null when the key maps to nothing.
    Value(*const V),
    /// The table is being migrated; the successor holds the answer.
    Moved,
}

/// What a single-table update resolved to.
pub(crate) enum Update<V> {
    /// The value previously mapped (null for none). A failed conditional
    /// update also lands here, reporting the value that didn't match.
    Prior(*const V),
    /// The table is being migrated; retry on the successor.
    Moved,
    /// Migration only: the key mapped to nothing, so there is nothing to
    /// carry over.
    Tombstone,
}

/// A pair of block counters backing one phase of cooperative work.
///
/// `todo` hands out block tickets, `done` counts blocks completed. The two
/// sit on their own cache lines; helpers hammer them independently. Each pair
/// serves exactly one phase in its table's life, so a straggler from a
/// finished phase claims a ticket past the end and drains through the
/// barrier without touching anything.
pub(crate) struct Counters {
    todo: CachePadded<AtomicUsize>,
    done: CachePadded<AtomicUsize>,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            todo: CachePadded::new(AtomicUsize::new(0)),
            done: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Claim the next block ticket.
    pub(crate) fn claim(&self) -> usize {
        self.todo.fetch_add(1, Ordering::AcqRel)
    }

    /// Report a block done. Returns `true` while blocks remain outstanding.
    ///
    /// The release here publishes the block's contents to whoever leaves
    /// `barrier`.
    pub(crate) fn finish(&self, blocks: usize) -> bool {
        self.done.fetch_add(1, Ordering::AcqRel) < blocks
    }

    /// Wait until every one of `blocks` blocks has been reported done.
    pub(crate) fn barrier(&self, blocks: usize) {
        let backoff = Backoff::new();
        while self.done.load(Ordering::Acquire) < blocks {
            backoff.snooze();
        }
    }
}

/// A single entry of a table.
pub(crate) struct Slot<K, V> {
    /// The key; null while free, the moved marker once migrated.
    pub(crate) key: AtomicPtr<K>,
    /// The memoized key hash; 0 until the claiming writer publishes it.
    pub(crate) hash: AtomicU32,
    /// The mapped value; null when absent, the moved marker once migrated.
    pub(crate) val: AtomicPtr<V>,
}

impl<K, V> Slot<K, V> {
    fn key(&self) -> *mut K {
        self.key.load(Ordering::Acquire)
    }

    fn val(&self) -> *mut V {
        self.val.load(Ordering::Acquire)
    }

    /// Read the published hash.
    ///
    /// A writer that claimed the key may not have come around to writing the
    /// hash yet. It will in a bounded number of its instructions, so we spin
    /// the time slice away rather than block.
    pub(crate) fn hash(&self) -> u32 {
        let mut h = self.hash.load(Ordering::Acquire);
        let backoff = Backoff::new();
        while h == 0 {
            backoff.snooze();
            h = self.hash.load(Ordering::Acquire);
        }
        h
    }
}

/// One generation of the backing array.
pub(crate) struct Table<K, V> {
    /// The number of slots; always a power of two, so `hash & (len - 1)`
    /// indexes.
    pub(crate) len: usize,
    /// Work counters for cooperatively initializing this table's slots.
    pub(crate) zeroing: Counters,
    /// Work counters for cooperatively copying this table out to its
    /// successor.
    pub(crate) copying: Counters,
    /// When this table left service, in wall-clock seconds; 0 while live.
    /// The grace sweeper frees the table once this is old enough.
    pub(crate) retired: AtomicUsize,
    /// Older retired generations, kept reachable until readers must be done
    /// with them.
    pub(crate) prev: AtomicPtr<Table<K, V>>,
    /// The slot array. Allocated uninitialized and zeroed in blocks, so many
    /// threads can share the cost of initializing a large table.
    slots: *mut Slot<K, V>,
}

impl<K, V> Table<K, V> {
    /// Allocate a table, leaving the slots uninitialized.
    ///
    /// The slots must be run through `zero` before the table is read from;
    /// the migration does so cooperatively via its zeroing blocks.
    pub(crate) fn alloc(len: usize) -> *mut Table<K, V> {
        debug_assert!(len.is_power_of_two());

        let layout = Self::layout(len);
        let slots = unsafe { alloc::alloc(layout) as *mut Slot<K, V> };
        if slots.is_null() {
            // There is nothing sensible to do without memory.
            alloc::handle_alloc_error(layout);
        }

        Box::into_raw(Box::new(Table {
            len: len,
            zeroing: Counters::new(),
            copying: Counters::new(),
            retired: AtomicUsize::new(0),
            prev: AtomicPtr::new(ptr::null_mut()),
            slots: slots,
        }))
    }

    /// Allocate a table with every slot already free.
    pub(crate) fn alloc_zeroed(len: usize) -> *mut Table<K, V> {
        let table = Self::alloc(len);
        unsafe {
            (*table).zero(0, len);
        }
        table
    }

    /// The layout of the slot array.
    fn layout(len: usize) -> alloc::Layout {
        alloc::Layout::array::<Slot<K, V>>(len).expect("slot array size overflows")
    }

    /// Initialize the slots in `[from, to)` to the free state.
    pub(crate) fn zero(&self, from: usize, to: usize) {
        debug_assert!(to <= self.len);
        for i in from..to {
            unsafe {
                ptr::write(
                    self.slots.add(i),
                    Slot {
                        key: AtomicPtr::new(ptr::null_mut()),
                        hash: AtomicU32::new(0),
                        val: AtomicPtr::new(ptr::null_mut()),
                    },
                );
            }
        }
    }

    /// Get slot `idx`.
    pub(crate) fn slot(&self, idx: usize) -> &Slot<K, V> {
        debug_assert!(idx < self.len);
        unsafe { &*self.slots.add(idx) }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        unsafe {
            // Keys buried with this table go with it. Everything else still
            // hanging off the slots is either owned by a successor table by
            // now or freed explicitly by the map's own teardown.
            for i in 0..self.len {
                let slot = &*self.slots.add(i);
                let k = slot.key.load(Ordering::Relaxed);
                if !k.is_null()
                    && k != moved()
                    && slot.val.load(Ordering::Relaxed) == tombstone()
                {
                    drop(Box::from_raw(k));
                }
            }
            alloc::dealloc(self.slots as *mut u8, Self::layout(self.len));
        }
    }
}

impl<K: Key, V> Table<K, V> {
    /// Look up `key` in this table alone, without following migrations.
    ///
    /// Linear reprobing from the hash's home slot. A free slot terminates the
    /// probe chain (writers never leapfrog one), and a full circle without a
    /// match means the mapping does not exist.
    pub(crate) fn lookup(&self, key: &K, hash: u32) -> Probe<V> {
        let mut idx = hash as usize & (self.len - 1);

        for _ in 0..self.len {
            let slot = self.slot(idx);
            let k = slot.key();

            if k.is_null() {
                return Probe::Value(ptr::null());
            }
            if k == moved() {
                return Probe::Moved;
            }

            // Compare the memoized hash before paying for a key comparison.
            if slot.hash() == hash {
                // Pairs with the release claim of the key, so the stored key
                // is fully readable.
                atomic::fence(Ordering::Acquire);
                if unsafe { (*k).equals(key) } {
                    let val = slot.val();
                    if is_sealed(val) {
                        return Probe::Moved;
                    }
                    return Probe::Value(val as *const V);
                }
            }

            idx = (idx + 1) & (self.len - 1);
        }

        Probe::Value(ptr::null())
    }

    /// Insert, update or delete on this table alone.
    ///
    /// `migrating` marks calls made by the copy protocol; those never trigger
    /// a further resize, never touch the map counters, and report tombstones
    /// back to the copier instead of handling them.
    ///
    /// # Safety
    ///
    /// `key` must be a valid, uniquely owned allocation (`Box::into_raw`).
    /// Ownership passes to the table except when `Update::Moved` is returned,
    /// in which case the caller keeps it and may retry on the successor.
    pub(crate) unsafe fn update(
        &self,
        map: &HashMap<K, V>,
        key: *mut K,
        hash: u32,
        val: *const V,
        expected: Expected<V>,
        migrating: bool,
    ) -> Update<V> {
        let mut idx = hash as usize & (self.len - 1);
        let mut reprobes = 0;
        // Whether the key turned out to be stored already; the caller's copy
        // is surplus then and gets disposed once the update lands.
        let mut surplus = false;
        // Whether we claimed a free slot in this call. A claim in flight can
        // race the migration; see `surrender`.
        let mut claimed = false;

        // First find the slot to update, or claim a free one.
        let slot = loop {
            let slot = self.slot(idx);
            let mut k = slot.key();

            if k.is_null() {
                if val.is_null() && expected.admits_absent() {
                    // Deleting a mapping that does not exist. The copy
                    // protocol wants to know (the key is a tombstone there);
                    // everyone else just needs the slot confirmed still free.
                    if migrating {
                        return Update::Tombstone;
                    }
                    if slot
                        .key
                        .compare_exchange(
                            ptr::null_mut(),
                            ptr::null_mut(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // The map owns the key, and nothing maps to it.
                        drop(Box::from_raw(key));
                        return Update::Prior(ptr::null());
                    }
                }

                // Claim the free slot. The release pairs with the acquire
                // fence readers issue before comparing against the key.
                if slot
                    .key
                    .compare_exchange(ptr::null_mut(), key, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.hash.store(hash, Ordering::Release);
                    claimed = true;
                    break slot;
                }

                // Lost the claim; reread whatever beat us to the slot.
                k = slot.key();
            }

            if k == moved() {
                return Update::Moved;
            }

            if slot.hash() == hash {
                atomic::fence(Ordering::Acquire);
                if (*k).equals(&*key) {
                    // The mapping exists; this is the slot to swing.
                    surplus = true;
                    break slot;
                }
            }

            reprobes += 1;
            if !migrating && reprobes >= REPROBE_LIMIT {
                // Too clustered to keep probing; trade the loop for a new
                // generation. The copier is exempt: it probes a table nobody
                // else fills, and must place every key it carries.
                return resize::grow(map, self as *const Table<K, V> as *mut Table<K, V>);
            }
            idx = (idx + 1) & (self.len - 1);
        };

        // Then swing the slot's value.
        let mut v = slot.val();
        if is_sealed(v) {
            return self.surrender(slot, key, claimed);
        }
        if !migrating && !v.is_null() {
            // Don't waste a write on a table that is about to be retired.
            let this = self as *const Table<K, V> as *mut Table<K, V>;
            let nkvs = map.nkvs.load(Ordering::Acquire);
            if !nkvs.is_null() && nkvs != this {
                return Update::Moved;
            }
            if map.kvs.load(Ordering::Acquire) != this {
                return Update::Moved;
            }
        }

        loop {
            if let Expected::Is(want) = expected {
                if v as *const V != want {
                    // The precondition failed; report the actual value,
                    // having written nothing. The copier carries values
                    // nobody else can touch, so it never ends up here.
                    assert!(!migrating, "a migrated value changed under the copy");
                    return Update::Prior(v as *const V);
                }
            }

            match slot
                .val
                .compare_exchange(v, val as *mut V, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if !migrating {
                        if v.is_null() && !val.is_null() {
                            map.size.fetch_add(1, Ordering::Relaxed);
                        }
                        if !v.is_null() && val.is_null() {
                            map.size.fetch_sub(1, Ordering::Relaxed);
                        }
                        map.changes.fetch_add(1, Ordering::Relaxed);
                    }
                    if surplus {
                        // The stored key stays; the caller's duplicate goes.
                        drop(Box::from_raw(key));
                    }
                    return Update::Prior(v as *const V);
                }
                Err(actual) => {
                    // Lost the race to update; retry against the new value.
                    v = actual;
                    if is_sealed(v) {
                        return self.surrender(slot, key, claimed);
                    }
                }
            }
        }
    }

    /// Give up on a slot whose value got sealed by the migration.
    ///
    /// For a slot we claimed in this very call, the copier has taken the
    /// claim for a tombstone (the value was still null from its point of
    /// view) and is burying it. The key is not disposed of — buried keys live
    /// until their table is reclaimed — so we pull it back out of the slot
    /// and keep it for the retry on the successor. Nothing else ever writes a
    /// claimed key word, so the swap cannot be contended.
    unsafe fn surrender(&self, slot: &Slot<K, V>, key: *mut K, claimed: bool) -> Update<V> {
        if claimed {
            assert!(
                slot.key
                    .compare_exchange(key, moved(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok(),
                "reclaiming an in-flight claim"
            );
        }
        Update::Moved
    }
}
