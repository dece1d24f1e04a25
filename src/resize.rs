//! Cooperative table migration.
//!
//! A writer that runs out of probes starts a migration; every thread that
//! subsequently observes a moved marker helps it along. Exactly one thread
//! wins the right to allocate the successor table (by swinging the map's
//! next-table word to a promise marker); the work itself — initializing the
//! successor and carrying every live mapping over — is split into fixed-size
//! blocks that any helper can claim with a fetch-add, so the cost is shared
//! between however many threads happen to be around.
//!
//! Each table carries two dedicated counter pairs, one for being zeroed when
//! it enters service and one for being copied out when it leaves. A phase's
//! counters are never reused, so a helper that went to sleep inside one
//! generation and wakes up in another claims a ticket past the end of a
//! finished phase and falls straight through the barrier.
//!
//! Retired tables are not freed immediately: other threads may still be
//! probing them for moved markers. They are kept on a chain hanging off the
//! successor and freed only once a grace period has passed. The grace is
//! wall-clock, not reference-counted; a thread suspended for longer than the
//! grace can touch a freed table. That trade-off is inherited by design and
//! spelled out on the public types.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_utils::Backoff;

use crate::debug;
use crate::table::{moved, promise, tombstone, Table, Update};
use crate::{Expected, HashMap, Key};

/// Slots per claimable unit of migration work.
const BLOCK_SIZE: usize = 8192;

/// Seconds a retired table stays allocated before the sweeper may free it.
const GRACE_SECONDS: usize = 30;

/// Wall-clock seconds. The grace bookkeeping wants nothing finer.
fn current_time() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as usize)
        .unwrap_or(0)
}

/// How many blocks it takes to cover `len` slots.
fn blocks(len: usize) -> usize {
    1 + (len - 1) / BLOCK_SIZE
}

/// Claim and initialize the next block of a freshly allocated table.
///
/// Returns `true` while blocks remain to claim. A claimless call waits at the
/// barrier until every helper has reported done, so when `false` comes back
/// the whole table is initialized and safe to fill.
fn zero_block<K, V>(nkvs: &Table<K, V>) -> bool {
    let todo = blocks(nkvs.len);

    let block = nkvs.zeroing.claim();
    if block >= todo {
        nkvs.zeroing.barrier(todo);
        return false;
    }

    let from = block * BLOCK_SIZE;
    let to = (from + BLOCK_SIZE).min(nkvs.len);
    nkvs.zero(from, to);

    nkvs.zeroing.finish(todo)
}

/// Claim and migrate the next block of the table being retired.
///
/// Same claiming and barrier contract as `zero_block`. Every slot of the
/// block is driven to one of the moved states: free slots are sealed
/// directly, live mappings are carried to the successor, and tombstones
/// (keys mapping to nothing) are disposed of.
unsafe fn copy_block<K: Key, V>(
    map: &HashMap<K, V>,
    okvs: &Table<K, V>,
    nkvs: &Table<K, V>,
) -> bool {
    let todo = blocks(okvs.len);

    let block = okvs.copying.claim();
    if block >= todo {
        okvs.copying.barrier(todo);
        return false;
    }

    let from = block * BLOCK_SIZE;
    let to = (from + BLOCK_SIZE).min(okvs.len);

    for i in from..to {
        let slot = okvs.slot(i);
        loop {
            let k = slot.key.load(Ordering::Acquire);

            if k.is_null() {
                // Free slot; seal it so late writers go to the successor.
                if slot
                    .key
                    .compare_exchange(
                        ptr::null_mut(),
                        moved(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break;
                }
                // A writer claimed it under us; handle the claim.
                debug::exec(|| println!("copy: lost slot {} to a claim; retrying", i));
                continue;
            }

            // A claimed slot: freeze the value first, then carry the mapping.
            let old = slot.val.load(Ordering::Acquire);
            if slot
                .val
                .compare_exchange(old, moved(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug::exec(|| println!("copy: lost the value race on slot {}; retrying", i));
                continue;
            }

            if let Update::Tombstone = nkvs.update(
                map,
                k,
                slot.hash(),
                old as *const V,
                Expected::Is(ptr::null()),
                true,
            ) {
                // The key mapped to nothing, so nothing is carried over. It
                // is not freed here either: late readers may still be
                // comparing against it, and a writer whose claim we took for
                // a tombstone may still pull it back out of the key word.
                // The seal below buries the slot; a key still in it when the
                // table is reclaimed goes with the table.
                slot.val.store(tombstone(), Ordering::Release);
            }
            break;
        }
    }

    okvs.copying.finish(todo)
}

/// Grow (or compact) the map after a writer ran out of probes on `okvs`.
///
/// Whoever loses any of the races in here just reports the migration; the
/// caller then goes helping like everyone else.
pub(crate) unsafe fn grow<K: Key, V>(map: &HashMap<K, V>, okvs: *mut Table<K, V>) -> Update<V> {
    if !map.nkvs.load(Ordering::Acquire).is_null() {
        // Somebody already produced a successor.
        return Update::Moved;
    }
    if map.kvs.load(Ordering::Acquire) != okvs {
        // Somebody already promoted one.
        return Update::Moved;
    }

    if map
        .nkvs
        .compare_exchange(
            ptr::null_mut(),
            promise(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        // Lost the race to produce the successor.
        return Update::Moved;
    }

    if map.kvs.load(Ordering::Acquire) != okvs {
        // So late that the previous generation's winner already moved on.
        // Take the promise back out so the next migration isn't locked out.
        assert!(
            map.nkvs
                .compare_exchange(
                    promise(),
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire
                )
                .is_ok(),
            "rolling back a late promise"
        );
        return Update::Moved;
    }

    // We won the race to produce the successor.
    let size = map.len();
    let len = (*okvs).len;
    let changes = map.changes.load(Ordering::Relaxed);

    let nkvs = if changes > len / 4 && (size as f32) / (len as f32) < 0.3 {
        // Plenty of mutations but a poor fill ratio: the table is clogged
        // with tombstones, and a same-size copy is enough to shed them.
        debug::exec(|| println!("resize: compacting at length {}", len));
        Table::alloc(len)
    } else {
        debug::exec(|| println!("resize: doubling to length {}", len * 2));
        Table::alloc(len * 2)
    };

    // Publish the successor so other threads can start helping.
    map.nkvs.store(nkvs, Ordering::Release);

    while zero_block(&*nkvs) {}
    while copy_block(map, &*okvs, &*nkvs) {}

    // The old table stays reachable: plenty of threads may still be reading
    // its moved markers. It is freed once the grace period has passed.
    retire(&*nkvs, okvs);
    sweep(&*nkvs);

    // Promotion order matters: current table first, then the next-table word,
    // so a helper compensating for a late promise never starts a bogus
    // migration in between.
    assert!(
        map.kvs
            .compare_exchange(okvs, nkvs, Ordering::AcqRel, Ordering::Acquire)
            .is_ok(),
        "promoting the successor"
    );
    assert!(
        map.nkvs
            .compare_exchange(nkvs, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok(),
        "clearing the finished migration"
    );
    map.changes.store(0, Ordering::Relaxed);
    debug::exec(|| println!("resize: promoted length {}", (*nkvs).len));

    // Always report the migration so the caller reruns on the new table.
    Update::Moved
}

/// Link a retired table into the successor's history, stamped for the
/// sweeper.
unsafe fn retire<K, V>(nkvs: &Table<K, V>, okvs: *mut Table<K, V>) {
    (*okvs).retired.store(current_time(), Ordering::Release);
    nkvs.prev.store(okvs, Ordering::Release);
}

/// Free every table on the chain that has outlived the grace period.
///
/// Only the migration winner walks the chain. A table may only go once
/// everything older is gone too, so this frees the oldest run of the chain
/// in which every stamp is past the grace; a straggler still in grace keeps
/// whatever hides behind it alive as well.
unsafe fn sweep<K, V>(nkvs: &Table<K, V>) {
    let cutoff = current_time().saturating_sub(GRACE_SECONDS);

    // Find the link below the oldest table that is still in grace. Churn can
    // make the chain long, so this walks it flat rather than recursing.
    let mut suffix: &AtomicPtr<Table<K, V>> = &nkvs.prev;
    let mut scan = suffix.load(Ordering::Acquire);
    while !scan.is_null() {
        let next = &(*scan).prev;
        if (*scan).retired.load(Ordering::Acquire) >= cutoff {
            suffix = next;
        }
        scan = next.load(Ordering::Acquire);
    }

    // Everything hanging off that link has expired; unhook and free it.
    let mut cur = suffix.load(Ordering::Acquire);
    suffix.store(ptr::null_mut(), Ordering::Release);
    while !cur.is_null() {
        let older = (*cur).prev.load(Ordering::Relaxed);
        drop(Box::from_raw(cur));
        cur = older;
    }
}

impl<K: Key, V> HashMap<K, V> {
    /// Pitch in on a migration observed on `okvs`, returning once the map has
    /// moved past that table.
    ///
    /// If nobody has promised a successor yet, this starts the migration
    /// itself: the writer that hit the probe limit may have bailed to a newer
    /// generation without delivering, and somebody has to.
    pub(crate) unsafe fn help_resize(&self, okvs: *mut Table<K, V>) {
        if self.kvs.load(Ordering::Acquire) != okvs {
            return;
        }

        // Wait for the winner to publish the successor.
        let mut nkvs = self.nkvs.load(Ordering::Acquire);
        let backoff = Backoff::new();
        while nkvs.is_null() || nkvs == promise() {
            if self.kvs.load(Ordering::Acquire) != okvs {
                return;
            }
            if nkvs.is_null() {
                grow(self, okvs);
                return;
            }
            backoff.snooze();
            nkvs = self.nkvs.load(Ordering::Acquire);
        }

        while self.kvs.load(Ordering::Acquire) == okvs && zero_block(&*nkvs) {}
        while self.kvs.load(Ordering::Acquire) == okvs && copy_block(self, &*okvs, &*nkvs) {}

        // Hold until the winner promotes; returning earlier would just spin
        // the caller on the old table's moved markers.
        let backoff = Backoff::new();
        while self.kvs.load(Ordering::Acquire) == okvs {
            backoff.snooze();
        }
    }
}
