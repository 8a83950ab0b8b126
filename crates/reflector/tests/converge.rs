#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kestrel_api::{Callback, ListWatch, RecordingHandler, Storage};
use kestrel_backends::{KvClient, KvStorage, MemKv, MemTree, TreeStorage, TreeWatchConfig};
use kestrel_core::{namespace_key_func, JsonCodec, Layout, RawObject, Selector};
use kestrel_reflector::Reflector;
use kestrel_store::Indexer;

fn app(ns: &str, name: &str, v: i64) -> RawObject {
    RawObject::new(Some(ns), name).with_field("v", serde_json::json!(v))
}

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    for _ in 0..100 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    panic!("condition not reached: {what}");
}

fn sorted_keys(store: &Indexer<RawObject>) -> Vec<String> {
    let mut k = store.list_keys();
    k.sort();
    k
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tree_backend_mirror_and_deletion_with_cached_value() {
    let tree = MemTree::new();
    let backend: Arc<TreeStorage<RawObject>> = Arc::new(
        TreeStorage::new(Arc::new(tree.clone()), Arc::new(JsonCodec::new()), "/kestrel", Layout::Namespaced).with_config(TreeWatchConfig {
            supervise_interval: Duration::from_millis(50),
            ..Default::default()
        }),
    );
    backend.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();

    let store = Arc::new(Indexer::new(namespace_key_func::<RawObject>));
    let rec = RecordingHandler::<RawObject>::new();
    let r = Reflector::builder("apps", ListWatch::new(backend.clone(), "apps", Selector::everything()), Arc::clone(&store))
        .handler(rec.clone())
        .watch_health_interval(Duration::from_millis(50))
        .build();
    r.run();
    eventually("watching", || r.is_watching()).await;
    eventually("initial item", || store.contains_key("ns1/a")).await;

    backend.create("apps/ns2/b", &app("ns2", "b", 1), 0).await.unwrap();
    eventually("new item", || store.contains_key("ns2/b")).await;

    backend.delete("apps/ns1/a").await.unwrap();
    eventually("deleted item", || !store.contains_key("ns1/a")).await;

    let deletes: Vec<RawObject> = rec
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Callback::Delete(o) => Some(o),
            _ => None,
        })
        .collect();
    // the cached value is reported, not the synthesized stand-in
    assert_eq!(deletes, vec![app("ns1", "a", 1)]);
    r.stop().await;
    assert!(!r.is_watching());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kv_backend_converges_after_lost_events() {
    let kv = MemKv::new();
    let backend: Arc<KvStorage<RawObject>> = Arc::new(KvStorage::new(Arc::new(kv.clone()), Arc::new(JsonCodec::new()), "/kestrel", Layout::Namespaced));
    backend.create("apps/ns1/a", &app("ns1", "a", 1), 0).await.unwrap();
    backend.create("apps/ns1/c", &app("ns1", "c", 1), 0).await.unwrap();

    let store = Arc::new(Indexer::new(namespace_key_func::<RawObject>));
    let r = Reflector::builder("apps", ListWatch::new(backend.clone(), "apps", Selector::everything()), Arc::clone(&store))
        .resync_period(Duration::from_millis(300))
        .watch_health_interval(Duration::from_millis(50))
        .build();
    r.run();
    eventually("initial list", || store.len() == 2).await;
    eventually("watching", || r.is_watching()).await;

    // mutate behind the watch's back: events for these are lost
    kv.drop_watches();
    let raw = |o: &RawObject| serde_json::to_vec(o).unwrap();
    kv.delete("/kestrel/apps/ns1/c").await.unwrap();
    kv.put("/kestrel/apps/ns2/b", &raw(&app("ns2", "b", 1)), None).await.unwrap();
    kv.put("/kestrel/apps/ns1/a", &raw(&app("ns1", "a", 2)), None).await.unwrap();

    eventually("converged key set", || sorted_keys(&store) == vec!["ns1/a".to_string(), "ns2/b".to_string()]).await;
    eventually("converged value", || store.get_by_key("ns1/a") == Some(app("ns1", "a", 2))).await;
    eventually("watch restarted", || r.is_watching()).await;

    // live events flow again after the restart
    backend.create("apps/ns3/d", &app("ns3", "d", 1), 0).await.unwrap();
    eventually("live event", || store.contains_key("ns3/d")).await;
    r.stop().await;
}
