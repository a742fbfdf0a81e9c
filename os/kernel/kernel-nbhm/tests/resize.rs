use kernel_nbhm::Nbhm;
use kernel_nbhm::ebr::Collector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn hundred_keys_into_a_map_sized_for_64_resize_once() {
    let collector = Collector::new(1);
    let map = Nbhm::with_capacity(64);
    let g = collector.pin(0);
    assert_eq!(map.capacity(&g), 128);

    for k in 1..=100u64 {
        assert_eq!(map.put(&g, k << 12, k), Ok(None));
    }
    map.resize_barrier(&g);

    assert_eq!(map.generations_created(), 2);
    assert_eq!(map.reachable_generations(&g), 1);
    assert_eq!(map.capacity(&g), 256);
    for k in 1..=100u64 {
        assert_eq!(map.get(&g, k << 12), Some(k));
    }
    assert_eq!(map.len(&g), 100);
    drop(g);

    assert!(collector.has_pending());
    assert_eq!(collector.reclaim(), 1);
    assert!(!collector.has_pending());
}

#[test]
fn concurrent_disjoint_puts_survive_resizes() {
    const THREADS: usize = 4;
    const PER_THREAD: u64 = 5_000;

    let collector = Arc::new(Collector::new(THREADS + 1));
    let map = Arc::new(Nbhm::with_capacity(16));
    let barrier = Arc::new(Barrier::new(THREADS));
    let stop = Arc::new(AtomicBool::new(false));

    // background reclaimer, like the kernel's
    let reclaimer = {
        let (collector, stop) = (collector.clone(), stop.clone());
        thread::spawn(move || {
            let mut freed = 0;
            while !stop.load(Ordering::Acquire) {
                freed += collector.reclaim();
                thread::yield_now();
            }
            freed + collector.reclaim()
        })
    };

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let (collector, map, barrier) = (collector.clone(), map.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = ((t as u64) << 32) | (i + 1);
                    let g = collector.pin(t);
                    map.put(&g, key, i + 1).unwrap();
                    // read back something written earlier by this thread
                    let probe = ((t as u64) << 32) | (i / 2 + 1);
                    assert_eq!(map.get(&g, probe), Some(i / 2 + 1));
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let g = collector.pin(THREADS);
    map.resize_barrier(&g);
    for t in 0..THREADS as u64 {
        for i in 0..PER_THREAD {
            assert_eq!(map.get(&g, (t << 32) | (i + 1)), Some(i + 1));
        }
    }
    assert_eq!(map.len(&g), THREADS * PER_THREAD as usize);
    drop(g);

    stop.store(true, Ordering::Release);
    let freed = reclaimer.join().unwrap();
    assert_eq!(freed, map.generations_created() - 1);
}

#[test]
fn racing_put_if_null_has_one_winner_per_key() {
    const THREADS: usize = 4;
    const KEYS: u64 = 2_000;

    let collector = Arc::new(Collector::new(THREADS));
    let map = Arc::new(Nbhm::with_capacity(64));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (collector, map, barrier) = (collector.clone(), map.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                let mut wins = Vec::new();
                for k in 1..=KEYS {
                    let g = collector.pin(t);
                    let mine = (t as u64 + 1) * 1_000_000 + k;
                    if map.put_if_null(&g, k, mine).unwrap().is_none() {
                        wins.push((k, mine));
                    }
                }
                wins
            })
        })
        .collect();

    let mut winners = std::collections::HashMap::new();
    for h in handles {
        for (k, v) in h.join().unwrap() {
            assert!(winners.insert(k, v).is_none(), "two winners for key {k}");
        }
    }
    assert_eq!(winners.len() as u64, KEYS);

    let g = collector.pin(0);
    for (k, v) in winners {
        assert_eq!(map.get(&g, k), Some(v));
    }
}

#[test]
fn last_writer_wins_under_contention() {
    const THREADS: usize = 4;
    let collector = Arc::new(Collector::new(THREADS));
    let map = Arc::new(Nbhm::with_capacity(64));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (collector, map, barrier) = (collector.clone(), map.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                for round in 1..=1_000u64 {
                    let g = collector.pin(t);
                    for k in 1..=8u64 {
                        map.put(&g, k, round * 10 + t as u64).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let g = collector.pin(0);
    for k in 1..=8u64 {
        let v = map.get(&g, k).unwrap();
        assert_eq!(v / 10, 1_000, "key {k} ended with a stale round: {v}");
    }
}
