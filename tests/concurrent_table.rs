use std::hash::{BuildHasher, Hasher};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use ahash::RandomState;
use once_cell::sync::Lazy;

use lfhash::{Insertion, LfHash, Removal, TableConfig};

const NUM_THREADS: u64 = 8;
const KEYS_PER_THREAD: u64 = 2_000;

static HASHER: Lazy<RandomState> = Lazy::new(|| RandomState::with_seeds(7, 11, 13, 17));

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
struct Pair {
    key: u64,
    val: u64,
}

fn pair_key(pair: &Pair) -> &[u8] {
    let ptr = (&pair.key as *const u64).cast::<u8>();
    // SAFETY: a u64 is eight readable bytes.
    unsafe { std::slice::from_raw_parts(ptr, 8) }
}

fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = HASHER.build_hasher();
    hasher.write(key);
    hasher.finish()
}

fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

fn new_table(unique: bool) -> LfHash<Pair> {
    LfHash::new(TableConfig::new(unique, pair_key, hash_bytes, bytes_eq))
}

fn key(k: u64) -> [u8; 8] {
    k.to_le_bytes()
}

#[test]
fn no_lost_updates_across_threads() {
    let table = Arc::new(new_table(true));

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                for k in t * KEYS_PER_THREAD..(t + 1) * KEYS_PER_THREAD {
                    let outcome = table.insert(&mut pins, &Pair { key: k, val: k * 3 }).unwrap();
                    assert_eq!(outcome, Insertion::Inserted);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let total = NUM_THREADS * KEYS_PER_THREAD;
    assert_eq!(table.len() as u64, total);
    // Enough inserts crossed the load factor many times over.
    assert!(table.bucket_count() > 1);

    let mut pins = table.pin().unwrap();
    for k in 0..total {
        let found = table.get(&mut pins, &key(k)).unwrap().unwrap();
        assert_eq!(found.val, k * 3);
    }

    // No concurrent mutation anymore, so iteration sees each key once.
    let mut visited = 0u64;
    table
        .iterate(&mut pins, |_| {
            visited += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(visited, total);
}

#[test]
fn exactly_one_winner_per_contended_key() {
    let table = Arc::new(new_table(true));

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                let outcome = table.insert(&mut pins, &Pair { key: 42, val: t }).unwrap();
                (outcome == Insertion::Inserted, t)
            })
        })
        .collect();
    let outcomes: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    let winners: Vec<_> = outcomes.iter().filter(|(won, _)| *won).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(table.len(), 1);

    // The surviving value is the winner's, not a loser's.
    let mut pins = table.pin().unwrap();
    let found = table.get(&mut pins, &key(42)).unwrap().unwrap();
    assert_eq!(found.val, winners[0].1);
}

#[test]
fn concurrent_removes_claim_each_key_once() {
    let table = Arc::new(new_table(true));
    let total = NUM_THREADS * KEYS_PER_THREAD / 8;
    {
        let mut pins = table.pin().unwrap();
        for k in 0..total {
            table.insert(&mut pins, &Pair { key: k, val: 0 }).unwrap();
        }
    }

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                let mut removed = 0u64;
                for k in 0..total {
                    if table.remove(&mut pins, &key(k)).unwrap() == Removal::Removed {
                        removed += 1;
                    }
                }
                removed
            })
        })
        .collect();
    let removed: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();

    assert_eq!(removed, total);
    assert!(table.is_empty());
}

#[test]
fn churn_leaves_the_table_empty() {
    let table = Arc::new(new_table(true));

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                for round in 0..500u64 {
                    let k = t * 1_000_000 + round % 16;
                    table.insert(&mut pins, &Pair { key: k, val: k }).unwrap();
                    {
                        let found = table.get(&mut pins, &key(k)).unwrap().unwrap();
                        assert_eq!(found.val, k);
                    }
                    assert_eq!(table.remove(&mut pins, &key(k)).unwrap(), Removal::Removed);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert!(table.is_empty());
    let mut pins = table.pin().unwrap();
    let outcome = table
        .iterate(&mut pins, |pair| panic!("leftover key {}", pair.key))
        .unwrap();
    assert_eq!(outcome, lfhash::Iteration::Completed);
}

#[test]
fn readers_never_observe_torn_values() {
    // Writers only ever publish pairs with `val == key * 31`; a reader
    // seeing anything else has caught a half-built or recycled node.
    let table = Arc::new(new_table(true));
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                for round in 0..2_000u64 {
                    let k = t * 64 + round % 32;
                    table
                        .insert(&mut pins, &Pair { key: k, val: k.wrapping_mul(31) })
                        .unwrap();
                    table.remove(&mut pins, &key(k)).unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..4u64)
        .map(|_| {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                let mut hits = 0u64;
                while !done.load(Ordering::Relaxed) {
                    for k in 0..256u64 {
                        if let Some(found) = table.get(&mut pins, &key(k)).unwrap() {
                            assert_eq!(found.val, found.key.wrapping_mul(31));
                            hits += 1;
                        }
                    }
                }
                hits
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
    assert!(table.is_empty());
}

#[test]
fn deletes_and_inserts_of_one_key_interleave_cleanly() {
    // Per-key linearizability: after all threads settle, the key is present
    // iff inserts outnumber removes, and every intermediate get saw either
    // the live value or nothing.
    let table = Arc::new(new_table(true));

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut pins = table.pin().unwrap();
                let mut inserted = 0i64;
                for _ in 0..1_000 {
                    if t % 2 == 0 {
                        if table.insert(&mut pins, &Pair { key: 5, val: 155 }).unwrap()
                            == Insertion::Inserted
                        {
                            inserted += 1;
                        }
                    } else if table.remove(&mut pins, &key(5)).unwrap() == Removal::Removed {
                        inserted -= 1;
                    }
                    if let Some(found) = table.get(&mut pins, &key(5)).unwrap() {
                        assert_eq!(*found, Pair { key: 5, val: 155 });
                    }
                }
                inserted
            })
        })
        .collect();
    let balance: i64 = threads.into_iter().map(|t| t.join().unwrap()).sum();

    let mut pins = table.pin().unwrap();
    let present = table.get(&mut pins, &key(5)).unwrap().is_some();
    match balance {
        0 => assert!(!present),
        1 => assert!(present),
        other => panic!("impossible insert/remove balance {other}"),
    }
}
