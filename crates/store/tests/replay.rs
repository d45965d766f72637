#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kestrel_core::{EventKind, Key};
use kestrel_store::Cache;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;

fn obj(ns: &str, name: &str, rv: u64) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("kestrel.io", "v1", "Widget"));
    let mut o = DynamicObject::new(name, &ar).within(ns).data(serde_json::json!({ "rev": rv }));
    o.metadata.resource_version = Some(rv.to_string());
    o
}

/// Small deterministic generator so the sequences are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn replay_basic_sequence() {
    let cache = Cache::new();
    cache.on_event(EventKind::Added, obj("ns", "a", 1));
    cache.on_event(EventKind::Added, obj("ns", "a", 1));
    cache.on_event(EventKind::Added, obj("ns", "b", 2));
    cache.on_event(EventKind::Modified, obj("ns", "a", 3));
    cache.on_event(EventKind::Deleted, obj("ns", "b", 2));

    assert_eq!(cache.keys(), vec![Key::from("ns/a")]);
    let a = cache.get(&Key::from("ns/a")).expect("a cached");
    assert_eq!(a.resource_version().as_deref(), Some("3"));
    assert_eq!(cache.epoch(), 5);
}

#[test]
fn final_state_matches_last_event_per_key() {
    for seed in 1..=20u64 {
        let mut rng = Lcg(seed);
        let cache = Cache::new();
        let mut model: BTreeMap<Key, u64> = BTreeMap::new();
        for rv in 1..=400u64 {
            let name = format!("o{}", rng.next() % 12);
            let ns = if rng.next() % 2 == 0 { "a" } else { "b" };
            let o = obj(ns, &name, rv);
            let key = Key::of(&o);
            match rng.next() % 3 {
                0 => {
                    cache.on_event(EventKind::Deleted, o);
                    model.remove(&key);
                }
                1 => {
                    cache.on_event(EventKind::Modified, o);
                    model.insert(key, rv);
                }
                _ => {
                    cache.on_event(EventKind::Added, o);
                    model.insert(key, rv);
                }
            }
        }
        let got: BTreeMap<Key, u64> = cache
            .list(None, |_| true)
            .iter()
            .map(|o| (Key::of(&**o), o.resource_version().and_then(|v| v.parse().ok()).unwrap_or(0)))
            .collect();
        assert_eq!(got, model, "seed {} diverged", seed);
    }
}
