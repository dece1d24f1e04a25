use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use crate::{Expected, HashMap, Key};

/// A string key hashed with seahash.
#[derive(Debug)]
struct Name(String);

impl Name {
    fn boxed(s: &str) -> Box<Name> {
        Box::new(Name(s.to_owned()))
    }
}

impl Key for Name {
    fn hash(&self) -> u32 {
        seahash::hash(self.0.as_bytes()) as u32
    }

    fn equals(&self, other: &Name) -> bool {
        self.0 == other.0
    }
}

fn name(s: &str) -> Name {
    Name(s.to_owned())
}

/// Leak a string value; the map stores the pointer, the test owns the leak.
fn val(s: &str) -> *const String {
    Box::into_raw(Box::new(s.to_owned()))
}

fn read<'a>(v: *const String) -> Option<&'a str> {
    unsafe { v.as_ref().map(|s| s.as_str()) }
}

#[test]
fn overwrite() {
    let map = HashMap::new();

    assert!(map.insert(Name::boxed("hello world"), val("bye world")).is_null());
    let prior = map.insert(Name::boxed("hello world"), val("see you soon"));
    assert_eq!(read(prior), Some("bye world"));

    assert_eq!(read(map.get(&name("hello world"))), Some("see you soon"));
    assert_eq!(map.len(), 1);
}

#[test]
fn delete() {
    let map = HashMap::new();

    map.insert(Name::boxed("hello world"), val("bye world"));
    assert_eq!(map.len(), 1);

    let prior = map.remove(Name::boxed("hello world"));
    assert_eq!(read(prior), Some("bye world"));
    assert_eq!(map.len(), 0);
    assert!(map.get(&name("hello world")).is_null());
}

#[test]
fn delete_absent() {
    let map: HashMap<Name, String> = HashMap::new();

    assert!(map.remove(Name::boxed("missing")).is_null());
    assert_eq!(map.len(), 0);
    assert!(map.get(&name("missing")).is_null());
}

#[test]
fn conditional_update() {
    let map = HashMap::new();
    let a = val("A");
    let b = val("B");
    let c = val("C");

    map.insert(Name::boxed("k"), a);

    // The expectation holds; the update goes through.
    assert_eq!(map.put_if(Name::boxed("k"), b, Expected::Is(a)), a);
    assert_eq!(map.get(&name("k")), b);

    // The expectation is stale now; nothing is written.
    assert_eq!(map.put_if(Name::boxed("k"), c, Expected::Is(a)), b);
    assert_eq!(map.get(&name("k")), b);

    // Insert-if-absent on a present mapping fails the same way.
    assert_eq!(map.put_if(Name::boxed("k"), c, Expected::Is(ptr::null())), b);
    assert_eq!(map.get(&name("k")), b);
    assert_eq!(map.len(), 1);
}

// The foo1..foo4 sequence: deletes of absent mappings do nothing observable,
// and a full insert/delete round leaves the map empty.
#[test]
fn tombstone_round() {
    let map: HashMap<Name, String> = HashMap::new();

    for i in 0..4 {
        assert!(map.remove(Name::boxed(&format!("foo{}", i))).is_null());
    }
    assert_eq!(map.len(), 0);

    for i in 0..4 {
        map.insert(Name::boxed(&format!("foo{}", i)), val("bar"));
    }
    assert_eq!(map.len(), 4);

    for i in 0..4 {
        assert!(!map.remove(Name::boxed(&format!("foo{}", i))).is_null());
    }
    assert_eq!(map.len(), 0);
}

#[test]
fn fill_grows_table() {
    let map = HashMap::new();

    for i in 0..1000 {
        map.insert(Name::boxed(&format!("key {}", i)), val(&format!("value {}", i)));
    }

    assert_eq!(map.len(), 1000);
    assert!(map.capacity() >= 2048, "capacity: {}", map.capacity());

    for i in 0..1000 {
        let expected = format!("value {}", i);
        assert_eq!(read(map.get(&name(&format!("key {}", i)))), Some(expected.as_str()));
    }
}

/// Keys whose hashes all collide in any table shorter than 512 slots.
struct Clash(u32);

impl Key for Clash {
    fn hash(&self) -> u32 {
        self.0 * 256 + 9
    }

    fn equals(&self, other: &Clash) -> bool {
        self.0 == other.0
    }
}

#[test]
fn colliding_keys_force_growth() {
    let map: HashMap<Clash, u32> = HashMap::new();
    let vals: Vec<u32> = (0..24).collect();

    // Chains longer than the probe bound must trade clustering for growth
    // until the hashes spread out again.
    for i in 0..24 {
        map.insert(Box::new(Clash(i)), &vals[i as usize]);
    }

    assert_eq!(map.len(), 24);
    assert!(map.capacity() >= 512, "capacity: {}", map.capacity());

    for i in 0..24 {
        assert_eq!(map.get(&Clash(i)), &vals[i as usize] as *const u32);
    }
}

/// Keys whose hash function degenerates to zero.
struct ZeroHash(u8);

impl Key for ZeroHash {
    fn hash(&self) -> u32 {
        0
    }

    fn equals(&self, other: &ZeroHash) -> bool {
        self.0 == other.0
    }
}

#[test]
fn zero_hash_keys() {
    let map: HashMap<ZeroHash, u8> = HashMap::new();
    let vals: Vec<u8> = (0..3).collect();

    for i in 0..3 {
        map.insert(Box::new(ZeroHash(i)), &vals[i as usize]);
    }

    assert_eq!(map.len(), 3);
    for i in 0..3 {
        assert_eq!(map.get(&ZeroHash(i)), &vals[i as usize] as *const u8);
    }

    assert!(!map.remove(Box::new(ZeroHash(1))).is_null());
    assert!(map.get(&ZeroHash(1)).is_null());
    assert_eq!(map.len(), 2);
}

// Alternating insert and delete leaves only tombstones behind; the table
// should shed them by compacting in place instead of doubling forever.
#[test]
fn churn_compacts() {
    let map = HashMap::new();

    for i in 0..16 {
        let key = format!("churn {}", i);
        map.insert(Name::boxed(&key), val(&key));
        assert!(!map.remove(Name::boxed(&key)).is_null());
    }

    assert_eq!(map.len(), 0);
    assert_eq!(map.capacity(), 4, "tombstones were not compacted away");
}

#[test]
fn spam_insert() {
    let map = Arc::new(HashMap::new());
    let mut joins = Vec::new();

    for t in 0..5 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in 0..50_000usize {
                let key = format!("[{}]-{}", t, i);
                let prior = map.insert(Name::boxed(&key), Box::into_raw(Box::new(i)) as *const usize);
                assert!(prior.is_null());
            }

            // Read everything back while the other writers keep hammering.
            for i in 0..50_000usize {
                let got = map.get(&name(&format!("[{}]-{}", t, i)));
                assert!(!got.is_null());
                assert_eq!(unsafe { *got }, i);
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    // Exactly the union of what the threads inserted, nothing more.
    assert_eq!(map.len(), 5 * 50_000);
    for t in 0..5 {
        for i in (0..50_000usize).step_by(1000) {
            assert!(!map.get(&name(&format!("[{}]-{}", t, i))).is_null());
        }
    }
}

// A lone prober doing conditional round trips on its own key, raced by
// writers churning enough disjoint keys to keep migrations rolling.
#[test]
fn spam_conditional() {
    let map = Arc::new(HashMap::new());
    let base = val("probe");
    map.insert(Name::boxed("probe"), base);

    let mut joins = Vec::new();
    for t in 0..2 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in 0..30_000usize {
                map.insert(Name::boxed(&format!("filler [{}]-{}", t, i)), val("x"));
            }
        }));
    }

    let prober = {
        let map = map.clone();
        thread::spawn(move || {
            for _ in 0..1000 {
                let seen = map.get(&name("probe"));
                assert!(!seen.is_null());

                let xxx = val("XXX");
                let yyy = val("YYY");

                // Nobody else writes this key, so the first swing must land
                // and the second must miss.
                assert_eq!(map.put_if(Name::boxed("probe"), xxx, Expected::Is(seen)), seen);
                assert_eq!(map.put_if(Name::boxed("probe"), yyy, Expected::Is(seen)), xxx);
                assert_eq!(map.get(&name("probe")), xxx);

                map.insert(Name::boxed("probe"), seen);
            }
        })
    };

    for j in joins {
        j.join().unwrap();
    }
    prober.join().unwrap();

    assert_eq!(map.get(&name("probe")), base);
}

#[test]
fn spam_churn() {
    let map = Arc::new(HashMap::new());
    let mut joins = Vec::new();

    for _ in 0..5 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..20_000 {
                let n: usize = rng.gen_range(0..200);
                let key = Name::boxed(&format!("shared {}", n));

                if rng.gen_range(0..5) == 0 {
                    map.insert(key, Box::into_raw(Box::new(n)) as *const usize);
                } else {
                    map.remove(key);
                }

                if rng.gen_range(0..100) == 0 {
                    thread::yield_now();
                }
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    // Quiescent now: the size counter must agree with what probing finds.
    let mut live = 0;
    for n in 0..200 {
        if !map.get(&name(&format!("shared {}", n))).is_null() {
            live += 1;
        }
    }
    assert_eq!(map.len(), live);
}

/// The number of live `Counted` keys; exercised by `keys_dropped_exactly_once`
/// alone.
static COUNTED_LIVE: AtomicUsize = AtomicUsize::new(0);

/// A key that counts its allocations and drops.
struct Counted(usize);

impl Counted {
    fn boxed(n: usize) -> Box<Counted> {
        COUNTED_LIVE.fetch_add(1, Ordering::SeqCst);
        Box::new(Counted(n))
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        COUNTED_LIVE.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Key for Counted {
    fn hash(&self) -> u32 {
        seahash::hash(&self.0.to_le_bytes()) as u32
    }

    fn equals(&self, other: &Counted) -> bool {
        self.0 == other.0
    }
}

// Every key handed to the map is disposed exactly once, across stores,
// duplicates, deletes, migrations and teardown.
#[test]
fn keys_dropped_exactly_once() {
    let vals: Vec<usize> = (0..64).collect();

    {
        let map: HashMap<Counted, usize> = HashMap::new();

        // Stored keys; growing the table moves them without copying.
        for i in 0..64 {
            map.insert(Counted::boxed(i), &vals[i]);
        }
        // Deleting hands in duplicates, which are surplus.
        for i in 0..32 {
            assert!(!map.remove(Counted::boxed(i)).is_null());
        }
        // Deleting something absent consumes the key too.
        assert!(map.remove(Counted::boxed(999)).is_null());
        // Re-inserting hits stored keys; the new copies are surplus again.
        for i in 0..64 {
            map.insert(Counted::boxed(i), &vals[i]);
        }

        assert_eq!(map.len(), 64);
    }

    assert_eq!(COUNTED_LIVE.load(Ordering::SeqCst), 0);
}

/// The number of live `Jam` keys; exercised by `spam_colliding_churn` alone.
static JAM_LIVE: AtomicUsize = AtomicUsize::new(0);

/// A key that jams every table shorter than 256 slots into a single probe
/// chain, and counts its drops.
struct Jam(usize);

impl Jam {
    fn boxed(n: usize) -> Box<Jam> {
        JAM_LIVE.fetch_add(1, Ordering::SeqCst);
        Box::new(Jam(n))
    }
}

impl Drop for Jam {
    fn drop(&mut self) {
        JAM_LIVE.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Key for Jam {
    fn hash(&self) -> u32 {
        self.0 as u32 * 128 + 7
    }

    fn equals(&self, other: &Jam) -> bool {
        self.0 == other.0
    }
}

// Delete-heavy churn over a handful of fully colliding keys keeps the table
// tiny and compacting back-to-back, so in-flight claims constantly meet the
// copiers' tombstone handling. The books must balance anyway: the counter
// agrees with probing once quiescent, and every key is dropped exactly once.
#[test]
fn spam_colliding_churn() {
    static VALS: [usize; 24] = [
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
    ];

    {
        let map: Arc<HashMap<Jam, usize>> = Arc::new(HashMap::new());
        let mut joins = Vec::new();

        for _ in 0..4 {
            let map = map.clone();
            joins.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..20_000 {
                    let n: usize = rng.gen_range(0..24);
                    if rng.gen_range(0..10) < 3 {
                        map.insert(Jam::boxed(n), &VALS[n]);
                    } else {
                        map.remove(Jam::boxed(n));
                    }
                }
            }));
        }

        for j in joins {
            j.join().unwrap();
        }

        // The chains only spread out at 256 slots, so growth stops there no
        // matter how hard the churn pushed.
        assert!(map.capacity() <= 256, "capacity: {}", map.capacity());

        // Quiescent: the size counter must agree with what probing finds.
        let mut live = 0;
        for n in 0..24 {
            if !map.get(&Jam::boxed(n)).is_null() {
                live += 1;
            }
        }
        assert_eq!(map.len(), live);
    }

    assert_eq!(JAM_LIVE.load(Ordering::SeqCst), 0);
}
