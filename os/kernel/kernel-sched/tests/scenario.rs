use kernel_info::config::{SCHED_GRANULARITY_US, SCHED_QUANTA_US};
use kernel_sched::{Pick, SchedEntry, Scheduler, ThreadId, WaitQueue};
use kernel_sync::InterruptContext;
use std::sync::{Arc, Barrier};
use std::thread;

fn ctx() -> InterruptContext {
    unsafe { InterruptContext::new(0) }
}

fn tid(i: u32) -> ThreadId {
    ThreadId::new(i, 1)
}

#[test]
fn shorter_sleeper_wakes_first() {
    let mut s = Scheduler::new(8);
    s.spawn(tid(5)).unwrap();
    s.spawn(tid(1)).unwrap();

    // both go to sleep at t=0
    assert_eq!(s.pick_next(&ctx(), 0).thread(), Some(tid(5)));
    s.sleep_current(0, 5_000).unwrap();
    assert_eq!(s.pick_next(&ctx(), 0).thread(), Some(tid(1)));
    s.sleep_current(0, 1_000).unwrap();

    assert_eq!(s.pick_next(&ctx(), 500), Pick::Idle { wake_at: 1_000 });
    assert_eq!(s.waiting_len(), 2);

    let pick = s.pick_next(&ctx(), 1_000);
    assert_eq!(pick.thread(), Some(tid(1)));
    assert_eq!(s.waiting_len(), 1);

    // the 1000us sleeper sleeps again; the core idles until the other is due
    s.sleep_current(1_000, 100_000).unwrap();
    assert_eq!(s.pick_next(&ctx(), 1_000), Pick::Idle { wake_at: 5_000 });
    assert_eq!(s.pick_next(&ctx(), 5_000).thread(), Some(tid(5)));
}

#[test]
fn lowest_exec_time_is_always_picked() {
    let mut s = Scheduler::new(16);
    let exec_times = [9_000, 3_000, 12_000, 3_500, 800, 40_000];
    for (i, &t) in exec_times.iter().enumerate() {
        let mut e = SchedEntry::new(tid(u32::try_from(i).unwrap()));
        e.exec_time = t;
        s.admit(e).unwrap();
    }

    let mut sorted = exec_times.to_vec();
    sorted.sort_unstable();
    for expected in sorted {
        let pick = s.pick_next(&ctx(), 0);
        let thread = pick.thread().unwrap();
        let entry = s.block_current(0).unwrap();
        assert_eq!(entry.thread, thread);
        assert_eq!(entry.exec_time, expected);
    }
    assert_eq!(s.population(), 0);
}

#[test]
fn sleepers_never_wake_early() {
    let mut s = Scheduler::new(64);
    for i in 0..32 {
        s.spawn(tid(i)).unwrap();
    }

    // every thread sleeps a different duration, starting at a different time
    let mut due = std::collections::HashMap::new();
    let mut now = 0;
    while let Some(thread) = s.pick_next(&ctx(), now).thread() {
        let d = 700 + u64::from(thread.index()) * 397;
        s.sleep_current(now, d).unwrap();
        due.insert(thread, now + d);
        now += 13;
    }
    assert_eq!(due.len(), 32);

    let mut woken = 0;
    while woken < 32 {
        match s.pick_next(&ctx(), now) {
            Pick::Run { thread, .. } => {
                assert!(now >= due[&thread], "{thread} woke at {now}, due {}", due[&thread]);
                s.remove(thread).unwrap();
                woken += 1;
            }
            Pick::Idle { wake_at } => {
                assert!(wake_at > now);
                assert_eq!(wake_at % SCHED_GRANULARITY_US, 0);
                now = wake_at;
            }
        }
    }
}

#[test]
fn ideal_slice_is_period_over_runnable() {
    for n in 1..=40_u32 {
        let mut s = Scheduler::new(64);
        for i in 0..n {
            s.spawn(tid(i)).unwrap();
        }
        let pick = s.pick_next(&ctx(), 0);
        let period = SCHED_QUANTA_US.max(SCHED_GRANULARITY_US * u64::from(n));
        assert_eq!(s.ideal_exec_time(), period / u64::from(n));

        // fresh threads get the whole ideal slice, rounded to the granularity
        let slice = pick.deadline();
        assert!(slice >= s.ideal_exec_time());
        assert!(slice < s.ideal_exec_time() + SCHED_GRANULARITY_US);
    }
}

#[test]
fn round_robin_shares_the_core_fairly() {
    let mut s = Scheduler::new(8);
    for i in 0..4 {
        s.spawn(tid(i)).unwrap();
    }

    // honour every deadline for a while
    let mut now = 0;
    let mut ran = [0_u64; 4];
    for _ in 0..400 {
        let Pick::Run { thread, deadline } = s.pick_next(&ctx(), now) else {
            panic!("core went idle with runnable threads");
        };
        ran[thread.index() as usize] += deadline - now;
        now = deadline;
    }

    let max = *ran.iter().max().unwrap();
    let min = *ran.iter().min().unwrap();
    assert!(max - min <= SCHED_QUANTA_US, "unfair split {ran:?}");
}

#[test]
fn concurrent_park_then_wake_all() {
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 100;

    let q = Arc::new(WaitQueue::new());
    let start = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let q = Arc::clone(&q);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..PER_THREAD {
                    q.park(t as usize, SchedEntry::new(ThreadId::new(t * PER_THREAD + i, 0)));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let all = q.wake_all();
    assert_eq!(all.len(), (THREADS * PER_THREAD) as usize);

    // per producer, FIFO order is preserved
    for t in 0..THREADS {
        let mine: Vec<u32> = all
            .iter()
            .filter(|p| p.core == t as usize)
            .map(|p| p.entry.thread.index())
            .collect();
        assert!(mine.windows(2).all(|w| w[0] < w[1]));
    }
    assert!(q.is_empty());
}

#[test]
fn blocked_thread_round_trips_through_a_wait_queue() {
    let mut s = Scheduler::new(4);
    let q = WaitQueue::new();
    s.spawn(tid(1)).unwrap();
    s.spawn(tid(2)).unwrap();

    assert_eq!(s.pick_next(&ctx(), 0).thread(), Some(tid(1)));
    q.park(0, s.block_current(2_000).unwrap());
    assert_eq!(s.pick_next(&ctx(), 2_000).thread(), Some(tid(2)));

    let parked = q.wake_one().unwrap();
    assert_eq!(parked.entry.exec_time, 2_000);
    assert_eq!(s.wake(parked.entry), Ok(false));
    assert!(s.contains(tid(1)));
}
