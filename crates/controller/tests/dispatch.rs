mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{controller, eventually, fast_config, widget};
use kestrel_core::{BackingStore, Error, Key, ScopeFilter};
use kestrel_kubehub::MemoryStore;
use kube::core::DynamicObject;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread")]
async fn updates_during_processing_collapse_into_latest() {
    let store = Arc::new(MemoryStore::<DynamicObject>::new());
    store.create(&widget("a", "x")).await.unwrap();
    let ctl = controller(&store, fast_config());

    let gate = Arc::new(Semaphore::new(0));
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    ctl.add_handler("observe", ScopeFilter::All, {
        let gate = gate.clone();
        let seen = seen.clone();
        move |_key: Key, obj: Option<DynamicObject>| {
            let gate = gate.clone();
            let seen = seen.clone();
            async move {
                let first = seen.lock().is_empty();
                if let Some(o) = obj {
                    seen.lock().push(o.resource_version().unwrap_or_default());
                }
                if first {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
                Ok::<_, Error>(None)
            }
        }
    })
    .unwrap();
    let token = CancellationToken::new();
    ctl.start(&token, 4).await.unwrap();
    eventually("first invocation", || async { seen.lock().len() == 1 }).await;

    let mut o = store.get(Some("a"), "x").await.unwrap();
    o.labels_mut().insert("step".into(), "1".into());
    let o = store.update(&o).await.unwrap();
    let mut o2 = o.clone();
    o2.labels_mut().insert("step".into(), "2".into());
    store.update(&o2).await.unwrap();
    eventually("cache caught up", || async {
        ctl.cache().get(&Key::from("a/x")).and_then(|o| o.resource_version()).as_deref() == Some("3")
    })
    .await;

    gate.add_permits(1);
    eventually("latest state handled", || async { seen.lock().len() == 2 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock(), vec!["1".to_string(), "3".to_string()]);

    ctl.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_invocation_per_key_at_a_time() {
    let store = Arc::new(MemoryStore::<DynamicObject>::new());
    for i in 0..8 {
        store.create(&widget("a", &format!("w{}", i))).await.unwrap();
    }
    let ctl = controller(&store, fast_config());
    let in_flight: Arc<Mutex<HashMap<Key, usize>>> = Arc::default();
    let violations = Arc::new(AtomicUsize::new(0));
    let latest: Arc<Mutex<HashMap<Key, String>>> = Arc::default();
    ctl.add_handler("serial", ScopeFilter::All, {
        let (in_flight, violations, latest) = (in_flight.clone(), violations.clone(), latest.clone());
        move |key: Key, obj: Option<DynamicObject>| {
            let (in_flight, violations, latest) = (in_flight.clone(), violations.clone(), latest.clone());
            async move {
                {
                    let mut m = in_flight.lock();
                    let n = m.entry(key.clone()).or_insert(0);
                    *n += 1;
                    if *n > 1 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                if let Some(o) = obj {
                    latest.lock().insert(key.clone(), o.resource_version().unwrap_or_default());
                }
                *in_flight.lock().entry(key).or_insert(1) -= 1;
                Ok::<_, Error>(None)
            }
        }
    })
    .unwrap();
    let token = CancellationToken::new();
    ctl.start(&token, 8).await.unwrap();

    for round in 0..5 {
        for i in 0..8 {
            let mut o = store.get(Some("a"), &format!("w{}", i)).await.unwrap();
            o.labels_mut().insert("round".into(), round.to_string());
            store.update(&o).await.unwrap();
        }
    }
    let want: HashMap<Key, String> = store
        .list(&Default::default())
        .await
        .unwrap()
        .items
        .iter()
        .map(|o| (Key::of(o), o.resource_version().unwrap_or_default()))
        .collect();
    eventually("every key handled at its final version", || async { *latest.lock() == want }).await;
    assert_eq!(violations.load(Ordering::SeqCst), 0);

    ctl.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_key_is_dropped_after_max_retries() {
    let store = Arc::new(MemoryStore::<DynamicObject>::new());
    store.create(&widget("a", "x")).await.unwrap();
    let config = fast_config();
    let expected = 1 + config.max_retries as usize;
    let ctl = controller(&store, config);
    let calls = Arc::new(AtomicUsize::new(0));
    ctl.add_handler("broken", ScopeFilter::All, {
        let calls = calls.clone();
        move |_key: Key, _obj: Option<DynamicObject>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Option<DynamicObject>, _>(Error::Transient("downstream unavailable".into()))
            }
        }
    })
    .unwrap();
    let token = CancellationToken::new();
    ctl.start(&token, 2).await.unwrap();

    eventually("retries exhausted", || async { calls.load(Ordering::SeqCst) == expected }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), expected);

    // A later change brings the key back.
    let mut o = store.get(Some("a"), "x").await.unwrap();
    o.labels_mut().insert("touched".into(), "yes".into());
    store.update(&o).await.unwrap();
    eventually("key redelivered after change", || async { calls.load(Ordering::SeqCst) > expected }).await;

    ctl.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn forget_drops_without_retry() {
    let store = Arc::new(MemoryStore::<DynamicObject>::new());
    store.create(&widget("a", "x")).await.unwrap();
    let ctl = controller(&store, fast_config());
    let calls = Arc::new(AtomicUsize::new(0));
    ctl.add_handler("forgetful", ScopeFilter::All, {
        let calls = calls.clone();
        move |_key: Key, _obj: Option<DynamicObject>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Option<DynamicObject>, _>(Error::Forget("not ours".into()))
            }
        }
    })
    .unwrap();
    let token = CancellationToken::new();
    ctl.start(&token, 2).await.unwrap();

    eventually("handled once", || async { calls.load(Ordering::SeqCst) == 1 }).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    ctl.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn forget_from_one_handler_keeps_retrying_another() {
    let store = Arc::new(MemoryStore::<DynamicObject>::new());
    store.create(&widget("a", "x")).await.unwrap();
    let config = fast_config();
    let expected = 1 + config.max_retries as usize;
    let ctl = controller(&store, config);
    ctl.add_handler("forgetful", ScopeFilter::All, |_key: Key, _obj: Option<DynamicObject>| async move {
        Err::<Option<DynamicObject>, _>(Error::Forget("not ours".into()))
    })
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    ctl.add_handler("flaky", ScopeFilter::All, {
        let calls = calls.clone();
        move |_key: Key, _obj: Option<DynamicObject>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Option<DynamicObject>, _>(Error::Transient("downstream unavailable".into()))
            }
        }
    })
    .unwrap();
    let token = CancellationToken::new();
    ctl.start(&token, 2).await.unwrap();

    eventually("flaky handler retried", || async { calls.load(Ordering::SeqCst) == expected }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), expected);

    ctl.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_chain_and_see_deletions() {
    let store = Arc::new(MemoryStore::<DynamicObject>::new());
    store.create(&widget("a", "x")).await.unwrap();
    store.create(&widget("b", "y")).await.unwrap();
    let ctl = controller(&store, fast_config());
    let observed: Arc<Mutex<Vec<(Key, Option<String>)>>> = Arc::default();

    ctl.add_handler("tag", ScopeFilter::Namespace("a".into()), |_key: Key, obj: Option<DynamicObject>| async move {
        Ok::<_, Error>(obj.map(|mut o| {
            o.labels_mut().insert("tagged".into(), "true".into());
            o
        }))
    })
    .unwrap();
    ctl.add_handler("observe", ScopeFilter::All, {
        let observed = observed.clone();
        move |key: Key, obj: Option<DynamicObject>| {
            let observed = observed.clone();
            async move {
                let tag = obj.and_then(|o| o.labels().get("tagged").cloned());
                observed.lock().push((key, tag));
                Ok::<_, Error>(None)
            }
        }
    })
    .unwrap();
    let token = CancellationToken::new();
    ctl.start(&token, 2).await.unwrap();

    eventually("both keys observed", || async { observed.lock().len() >= 2 }).await;
    {
        let seen = observed.lock();
        assert!(seen.contains(&(Key::from("a/x"), Some("true".into()))));
        assert!(seen.contains(&(Key::from("b/y"), None)));
    }

    store.delete(Some("b"), "y").await.unwrap();
    eventually("deletion delivered as None", || async {
        observed.lock().iter().filter(|(k, _)| k == &Key::from("b/y")).count() == 2
    })
    .await;

    ctl.stop().await;
}
