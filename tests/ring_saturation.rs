use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use filament::ring::{MpmcRing, ThreadPause};

fn saturate(producers: usize, consumers: usize, per_producer: u64, capacity: usize) {
    let ring: Arc<MpmcRing<u64>> = Arc::new(MpmcRing::new(capacity));
    let total = producers as u64 * per_producer;
    let done = Arc::new(AtomicBool::new(false));

    let mut producer_handles = Vec::new();
    for p in 0..producers as u64 {
        let ring = ring.clone();
        producer_handles.push(thread::spawn(move || {
            for i in 0..per_producer {
                ring.send::<ThreadPause>(p * per_producer + i);
            }
        }));
    }

    let mut consumer_handles = Vec::new();
    for _ in 0..consumers {
        let ring = ring.clone();
        let done = done.clone();
        consumer_handles.push(thread::spawn(move || {
            let mut popped = Vec::new();
            loop {
                match ring.pop() {
                    Some(v) => popped.push(v),
                    None if done.load(Ordering::Acquire) && ring.is_empty() => break,
                    None => thread::yield_now(),
                }
            }
            popped
        }));
    }

    for h in producer_handles {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let mut seen = vec![false; total as usize];
    let mut count = 0u64;
    for h in consumer_handles {
        for v in h.join().unwrap() {
            assert!(!seen[v as usize], "item {} popped twice", v);
            seen[v as usize] = true;
            count += 1;
        }
    }
    assert_eq!(count, total, "items were lost");
    assert!(seen.iter().all(|&s| s));
}

#[test]
fn saturation_smoke() {
    saturate(4, 2, 50_000, 64);
}

/// The full-scale run: capacity 1024, 8 producers pushing a million items
/// each, 4 consumers. Takes a while; run explicitly with `--ignored`.
#[test]
#[ignore]
fn saturation_full_scale() {
    saturate(8, 4, 1_000_000, 1024);
}
