#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_core::Key;
use kestrel_queue::{RetryPolicy, WorkQueue};
use parking_lot::Mutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_worker_per_key_at_a_time() {
    let q = WorkQueue::new("workers", RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(10)));
    let in_flight: Arc<Mutex<HashMap<Key, usize>>> = Arc::default();
    let violations = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let q = Arc::clone(&q);
        let in_flight = Arc::clone(&in_flight);
        let violations = Arc::clone(&violations);
        let processed = Arc::clone(&processed);
        workers.push(tokio::spawn(async move {
            while let Some(key) = q.get().await {
                {
                    let mut m = in_flight.lock();
                    let n = m.entry(key.clone()).or_insert(0);
                    *n += 1;
                    if *n > 1 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                *in_flight.lock().entry(key.clone()).or_insert(1) -= 1;
                processed.fetch_add(1, Ordering::SeqCst);
                q.done(&key);
            }
        }));
    }

    for round in 0..50 {
        for k in 0..4 {
            q.add(Key::new(Some("ns"), &format!("k{}", k)));
        }
        if round % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (!q.is_empty() || q.in_flight() > 0) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    q.shutdown();
    for w in workers {
        w.await.expect("worker");
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0, "a key was processed concurrently");
    let n = processed.load(Ordering::SeqCst);
    assert!(n >= 4, "every key processed at least once (got {})", n);
    assert!(n <= 200, "dedup keeps work bounded by adds (got {})", n);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_requeue_waits_for_backoff() {
    let q = WorkQueue::new("backoff", RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1)));
    let k = Key::from("a/x");

    assert_eq!(q.add_rate_limited(k.clone()), Duration::from_millis(100));
    assert_eq!(q.num_requeues(&k), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(q.is_empty());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(q.len(), 1);

    let got = q.get().await.expect("key");
    q.done(&got);
    assert_eq!(q.add_rate_limited(k.clone()), Duration::from_millis(200));
    q.forget(&k);
    assert_eq!(q.num_requeues(&k), 0);
}
